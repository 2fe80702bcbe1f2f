//! Payload layouts for the formula-bearing records.
//!
//! Record framing (opcode + length + CONTINUE reassembly) is the container
//! layer's job; this module only covers the payload bytes it hands over.
//!
//! FORMULA payload:
//! `[rw:u16][col:u16][ixfe:u16][num:8][grbit:u16][chn:u32][cce:u16][rgce][rgcb]`
//!
//! ARRAY payload:
//! `[rwFirst:u16][rwLast:u16][colFirst:u8][colLast:u8][grbit:u16][chn:u32][cce:u16][rgce][rgcb]`
//!
//! SHRFMLA payload:
//! `[rwFirst:u16][rwLast:u16][colFirst:u8][colLast:u8][reserved:u8][cUse:u8][cce:u16][rgce][rgcb]`
//!
//! `chn` is an application-specific cache and must be written as zero.

use gridcalc_model::{CellRef, ErrorValue, Range};

use crate::ptg::Ptg;
use crate::rgce::{encode_rgce, parse_rgce, RgceError};

/// FORMULA grbit bit 0: the result must not be cached.
pub const F_ALWAYS_CALC: u16 = 0x0001;
/// FORMULA grbit bit 1: the cached value is untrusted and recalculated on load.
pub const F_CALC_ON_LOAD: u16 = 0x0002;
/// FORMULA grbit bit 3: the rgce is a `PtgExp` reference to a shared formula.
pub const F_SHR_FMLA: u16 = 0x0008;

/// Errors parsing or building record payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record payload too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("invalid cached-value tag 0x{0:02X}")]
    InvalidCachedValue(u8),
    #[error(transparent)]
    Rgce(#[from] RgceError),
}

/// The FORMULA record's 8-byte cached-value field.
///
/// Non-numeric results use a sentinel encoding: bytes 6..8 are `0xFFFF` and
/// byte 0 tags the variant (0x00 string with attached STRING record, 0x01
/// boolean, 0x02 error code, 0x03 empty string). Anything else is an
/// IEEE-754 double.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CachedValue {
    Number(f64),
    /// The string itself lives in an attached STRING record.
    String,
    EmptyString,
    Boolean(bool),
    Error(ErrorValue),
    /// No trustworthy cached value (e.g. the stored double was NaN).
    /// Serializes as a NaN double, which parses back to `None`; readers
    /// must not trust it (`fCalcOnLoad` forces recalculation anyway).
    None,
}

impl CachedValue {
    fn parse(bytes: &[u8; 8]) -> Result<Self, RecordError> {
        if bytes[6] == 0xFF && bytes[7] == 0xFF {
            return match bytes[0] {
                0x00 => Ok(CachedValue::String),
                0x01 => Ok(CachedValue::Boolean(bytes[2] != 0)),
                0x02 => match ErrorValue::from_code(bytes[2]) {
                    Some(e) => Ok(CachedValue::Error(e)),
                    None => Err(RecordError::InvalidCachedValue(bytes[2])),
                },
                0x03 => Ok(CachedValue::EmptyString),
                tag => Err(RecordError::InvalidCachedValue(tag)),
            };
        }
        let n = f64::from_le_bytes(*bytes);
        // A NaN here is indistinguishable from sentinel garbage; treat it as
        // "no cached value" and force recalculation.
        if n.is_nan() {
            Ok(CachedValue::None)
        } else {
            Ok(CachedValue::Number(n))
        }
    }

    fn to_bytes(self) -> [u8; 8] {
        let sentinel = |tag: u8, payload: u8| {
            let mut b = [0u8; 8];
            b[0] = tag;
            b[2] = payload;
            b[6] = 0xFF;
            b[7] = 0xFF;
            b
        };
        match self {
            CachedValue::Number(n) => n.to_le_bytes(),
            CachedValue::String => sentinel(0x00, 0),
            CachedValue::EmptyString => sentinel(0x03, 0),
            CachedValue::Boolean(b) => sentinel(0x01, u8::from(b)),
            CachedValue::Error(e) => sentinel(0x02, e.code()),
            CachedValue::None => f64::NAN.to_le_bytes(),
        }
    }
}

fn get_u16(data: &[u8], pos: usize) -> Result<u16, RecordError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(RecordError::TooShort {
            need: pos + 2,
            have: data.len(),
        })
}

/// Parsed FORMULA record payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaRecord {
    pub cell: CellRef,
    /// Index into the XF (format) table. Preserved, not interpreted.
    pub ixfe: u16,
    pub cached: CachedValue,
    pub grbit: u16,
    pub tokens: Vec<Ptg>,
    /// Non-fatal trailing-payload warnings from rgce parsing.
    pub warnings: Vec<String>,
}

impl FormulaRecord {
    pub fn new(cell: CellRef, tokens: Vec<Ptg>) -> Self {
        Self {
            cell,
            ixfe: 0,
            cached: CachedValue::None,
            grbit: F_CALC_ON_LOAD,
            tokens,
            warnings: Vec::new(),
        }
    }

    pub fn always_calc(&self) -> bool {
        self.grbit & F_ALWAYS_CALC != 0
    }

    pub fn calc_on_load(&self) -> bool {
        self.grbit & F_CALC_ON_LOAD != 0
    }

    pub fn is_shared_reference(&self) -> bool {
        self.grbit & F_SHR_FMLA != 0
    }

    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        let row = get_u16(data, 0)?;
        let col = get_u16(data, 2)?;
        let ixfe = get_u16(data, 4)?;
        let num: [u8; 8] = data
            .get(6..14)
            .ok_or(RecordError::TooShort {
                need: 14,
                have: data.len(),
            })?
            .try_into()
            .expect("8-byte slice");
        let cached = CachedValue::parse(&num)?;
        let grbit = get_u16(data, 14)?;
        // chn at 16..20 is ignored on read.
        let cce = get_u16(data, 20)? as usize;
        let body = data.get(22..).ok_or(RecordError::TooShort {
            need: 22,
            have: data.len(),
        })?;
        let parsed = parse_rgce(body, cce)?;
        Ok(Self {
            cell: CellRef::new(row as u32, col as u32),
            ixfe,
            cached,
            grbit,
            tokens: parsed.tokens,
            warnings: parsed.warnings,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let enc = encode_rgce(&self.tokens);
        let mut out = Vec::with_capacity(22 + enc.rgce.len() + enc.rgcb.len());
        out.extend_from_slice(&(self.cell.row as u16).to_le_bytes());
        out.extend_from_slice(&(self.cell.col as u16).to_le_bytes());
        out.extend_from_slice(&self.ixfe.to_le_bytes());
        out.extend_from_slice(&self.cached.to_bytes());
        out.extend_from_slice(&self.grbit.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // chn
        out.extend_from_slice(&enc.cce().to_le_bytes());
        out.extend_from_slice(&enc.rgce);
        out.extend_from_slice(&enc.rgcb);
        out
    }
}

/// Parsed ARRAY record payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRecord {
    pub range: Range,
    pub grbit: u16,
    pub tokens: Vec<Ptg>,
    pub warnings: Vec<String>,
}

impl ArrayRecord {
    pub fn new(range: Range, tokens: Vec<Ptg>) -> Self {
        Self {
            range,
            grbit: F_CALC_ON_LOAD,
            tokens,
            warnings: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        let row_first = get_u16(data, 0)?;
        let row_last = get_u16(data, 2)?;
        let cols = data.get(4..6).ok_or(RecordError::TooShort {
            need: 6,
            have: data.len(),
        })?;
        let grbit = get_u16(data, 6)?;
        // chn at 8..12 is ignored on read.
        let cce = get_u16(data, 12)? as usize;
        let body = data.get(14..).ok_or(RecordError::TooShort {
            need: 14,
            have: data.len(),
        })?;
        let parsed = parse_rgce(body, cce)?;
        Ok(Self {
            range: Range::new(
                CellRef::new(row_first as u32, cols[0] as u32),
                CellRef::new(row_last as u32, cols[1] as u32),
            ),
            grbit,
            tokens: parsed.tokens,
            warnings: parsed.warnings,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let enc = encode_rgce(&self.tokens);
        let mut out = Vec::with_capacity(14 + enc.rgce.len() + enc.rgcb.len());
        out.extend_from_slice(&(self.range.start.row as u16).to_le_bytes());
        out.extend_from_slice(&(self.range.end.row as u16).to_le_bytes());
        out.push(self.range.start.col as u8);
        out.push(self.range.end.col as u8);
        out.extend_from_slice(&self.grbit.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // chn
        out.extend_from_slice(&enc.cce().to_le_bytes());
        out.extend_from_slice(&enc.rgce);
        out.extend_from_slice(&enc.rgcb);
        out
    }
}

/// Parsed SHRFMLA record payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ShrFmlaRecord {
    pub range: Range,
    /// Member-cell count hint; informational only.
    pub use_count: u8,
    pub tokens: Vec<Ptg>,
    pub warnings: Vec<String>,
}

impl ShrFmlaRecord {
    pub fn new(range: Range, use_count: u8, tokens: Vec<Ptg>) -> Self {
        Self {
            range,
            use_count,
            tokens,
            warnings: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        let row_first = get_u16(data, 0)?;
        let row_last = get_u16(data, 2)?;
        let tail = data.get(4..8).ok_or(RecordError::TooShort {
            need: 8,
            have: data.len(),
        })?;
        let (col_first, col_last, use_count) = (tail[0], tail[1], tail[3]);
        let cce = get_u16(data, 8)? as usize;
        let body = data.get(10..).ok_or(RecordError::TooShort {
            need: 10,
            have: data.len(),
        })?;
        let parsed = parse_rgce(body, cce)?;
        Ok(Self {
            range: Range::new(
                CellRef::new(row_first as u32, col_first as u32),
                CellRef::new(row_last as u32, col_last as u32),
            ),
            use_count,
            tokens: parsed.tokens,
            warnings: parsed.warnings,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let enc = encode_rgce(&self.tokens);
        let mut out = Vec::with_capacity(10 + enc.rgce.len() + enc.rgcb.len());
        out.extend_from_slice(&(self.range.start.row as u16).to_le_bytes());
        out.extend_from_slice(&(self.range.end.row as u16).to_le_bytes());
        out.push(self.range.start.col as u8);
        out.push(self.range.end.col as u8);
        out.push(0); // reserved
        out.push(self.use_count);
        out.extend_from_slice(&enc.cce().to_le_bytes());
        out.extend_from_slice(&enc.rgce);
        out.extend_from_slice(&enc.rgcb);
        out
    }
}

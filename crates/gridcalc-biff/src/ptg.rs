//! BIFF8 formula token (Ptg) model.
//!
//! Every token knows how to decode itself from the rgce byte stream, encode
//! itself back, and (for array literals / area markers) read and write its
//! share of the trailing `rgcb` payload that follows the declared rgce
//! length.
//!
//! Round-trip contract: `decode(encode(t)) == t` for every variant, with two
//! deliberate normalizations:
//! - `PtgStr` rich-text runs and extension data are dropped on decode;
//! - `PtgRefErr` / `PtgAreaErr` stale address payloads are zeroed on encode.

use gridcalc_model::{CellRef, CellValue, ErrorValue, Range};

/// Operand class of a classed ptg (the three parallel tag sub-ranges).
///
/// The same logical token appears with id `base` (reference class),
/// `base + 0x20` (value class) or `base + 0x40` (array class).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtgClass {
    Reference,
    Value,
    Array,
}

impl PtgClass {
    fn from_id(id: u8) -> Option<Self> {
        match id >> 5 {
            1 => Some(PtgClass::Reference),
            2 => Some(PtgClass::Value),
            3 => Some(PtgClass::Array),
            _ => None,
        }
    }

    fn id_offset(self) -> u8 {
        match self {
            PtgClass::Reference => 0x00,
            PtgClass::Value => 0x20,
            PtgClass::Array => 0x40,
        }
    }
}

const COL_INDEX_MASK: u16 = 0x3FFF;
const ROW_RELATIVE_BIT: u16 = 0x4000;
const COL_RELATIVE_BIT: u16 = 0x8000;

/// A single-cell location with relative/absolute flags, as stored in
/// `PtgRef`-family tokens: `[rw:u16][colFlags:u16]` where bit 15 of the
/// column field is the column-relative flag and bit 14 the row-relative flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RefLoc {
    pub row: u16,
    pub col: u16,
    pub row_rel: bool,
    pub col_rel: bool,
}

impl RefLoc {
    pub fn new(row: u16, col: u16, row_rel: bool, col_rel: bool) -> Self {
        Self {
            row,
            col,
            row_rel,
            col_rel,
        }
    }

    /// Fully relative location (the common case for typed-in formulas).
    pub fn relative(cell: CellRef) -> Self {
        Self::new(cell.row as u16, cell.col as u16, true, true)
    }

    /// Fully absolute location.
    pub fn absolute(cell: CellRef) -> Self {
        Self::new(cell.row as u16, cell.col as u16, false, false)
    }

    fn from_wire(row: u16, col_field: u16) -> Self {
        Self {
            row,
            col: col_field & COL_INDEX_MASK,
            row_rel: col_field & ROW_RELATIVE_BIT != 0,
            col_rel: col_field & COL_RELATIVE_BIT != 0,
        }
    }

    fn col_field(&self) -> u16 {
        let mut field = self.col & COL_INDEX_MASK;
        if self.row_rel {
            field |= ROW_RELATIVE_BIT;
        }
        if self.col_rel {
            field |= COL_RELATIVE_BIT;
        }
        field
    }

    pub fn cell(&self) -> CellRef {
        CellRef::new(self.row as u32, self.col as u32)
    }

    /// A1 text with `$` markers on absolute parts.
    pub fn to_a1(&self) -> String {
        format!(
            "{}{}{}{}",
            if self.col_rel { "" } else { "$" },
            gridcalc_model::col_to_name(self.col as u32),
            if self.row_rel { "" } else { "$" },
            self.row as u32 + 1
        )
    }
}

/// A rectangular area with per-corner relative flags, as stored in
/// `PtgArea`-family tokens: `[rwFirst][rwLast][colFlagsFirst][colFlagsLast]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AreaLoc {
    pub first: RefLoc,
    pub last: RefLoc,
}

impl AreaLoc {
    pub fn new(first: RefLoc, last: RefLoc) -> Self {
        Self { first, last }
    }

    pub fn range(&self) -> Range {
        Range::new(self.first.cell(), self.last.cell())
    }

    pub fn to_a1(&self) -> String {
        format!("{}:{}", self.first.to_a1(), self.last.to_a1())
    }
}

/// An array constant: `rows x cols` literals stored row-major in the
/// trailing rgcb payload (the rgce itself carries only reserved bytes).
///
/// `values` is empty when the trailing payload was missing or truncated;
/// the parser recovers by leaving the literal empty.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayLiteral {
    pub rows: u16,
    pub cols: u16,
    pub values: Vec<CellValue>,
}

impl ArrayLiteral {
    pub fn new(rows: u16, cols: u16, values: Vec<CellValue>) -> Self {
        debug_assert_eq!(values.len(), rows as usize * cols as usize);
        Self { rows, cols, values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&CellValue> {
        self.values.get(row * self.cols as usize + col)
    }
}

/// `PtgAttr` variants (`tAttr`).
///
/// The jump offsets in `If`/`Choose`/`Goto` are short-circuit hints for the
/// stream evaluator; the postfix evaluator here ignores them but preserves
/// them for round-tripping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attr {
    /// Volatile-expression marker.
    Semi,
    If { skip: u16 },
    Choose { jumps: Vec<u16> },
    Goto { skip: u16 },
    /// Optimized single-argument SUM.
    Sum,
    /// Whitespace preserved from the original formula text.
    Space { kind: u8, count: u8 },
}

const ATTR_SEMI: u8 = 0x01;
const ATTR_IF: u8 = 0x02;
const ATTR_CHOOSE: u8 = 0x04;
const ATTR_GOTO: u8 = 0x08;
const ATTR_SUM: u8 = 0x10;
const ATTR_SPACE: u8 = 0x40;

/// Ptg ids (reference-class base for classed tokens).
pub mod id {
    pub const EXP: u8 = 0x01;
    pub const ADD: u8 = 0x03;
    pub const SUB: u8 = 0x04;
    pub const MUL: u8 = 0x05;
    pub const DIV: u8 = 0x06;
    pub const POWER: u8 = 0x07;
    pub const CONCAT: u8 = 0x08;
    pub const LT: u8 = 0x09;
    pub const LE: u8 = 0x0A;
    pub const EQ: u8 = 0x0B;
    pub const GE: u8 = 0x0C;
    pub const GT: u8 = 0x0D;
    pub const NE: u8 = 0x0E;
    pub const ISECT: u8 = 0x0F;
    pub const UNION: u8 = 0x10;
    pub const RANGE: u8 = 0x11;
    pub const UNARY_PLUS: u8 = 0x12;
    pub const UNARY_MINUS: u8 = 0x13;
    pub const PERCENT: u8 = 0x14;
    pub const PAREN: u8 = 0x15;
    pub const MISSING_ARG: u8 = 0x16;
    pub const STR: u8 = 0x17;
    pub const ATTR: u8 = 0x19;
    pub const ERR: u8 = 0x1C;
    pub const BOOL: u8 = 0x1D;
    pub const INT: u8 = 0x1E;
    pub const NUM: u8 = 0x1F;
    pub const ARRAY: u8 = 0x20;
    pub const FUNC: u8 = 0x21;
    pub const FUNC_VAR: u8 = 0x22;
    pub const NAME: u8 = 0x23;
    pub const REF: u8 = 0x24;
    pub const AREA: u8 = 0x25;
    pub const MEM_AREA: u8 = 0x26;
    pub const REF_ERR: u8 = 0x2A;
    pub const AREA_ERR: u8 = 0x2B;
    pub const REF_3D: u8 = 0x3A;
    pub const AREA_3D: u8 = 0x3B;
    pub const REF_ERR_3D: u8 = 0x3C;
    pub const AREA_ERR_3D: u8 = 0x3D;
}

/// One unit of a postfix-encoded formula expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Ptg {
    /// Shared/array formula pointer: the host cell holding the real
    /// expression.
    Exp { row: u16, col: u16 },
    Add,
    Sub,
    Mul,
    Div,
    Power,
    Concat,
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
    Ne,
    /// Range intersection (space operator).
    Isect,
    /// Range union (comma operator).
    Union,
    /// Range construction (colon operator).
    RangeOp,
    UnaryPlus,
    UnaryMinus,
    Percent,
    /// Explicit parentheses preserved from the source text.
    Paren,
    /// Omitted function argument.
    MissingArg,
    Str(String),
    Attr(Attr),
    Err(ErrorValue),
    Bool(bool),
    Int(u16),
    Num(f64),
    Array {
        class: PtgClass,
        literal: ArrayLiteral,
    },
    Func {
        class: PtgClass,
        iftab: u16,
    },
    FuncVar {
        class: PtgClass,
        iftab: u16,
        argc: u8,
    },
    Name {
        class: PtgClass,
        /// 1-based index into the workbook name table.
        iname: u16,
    },
    Ref {
        class: PtgClass,
        loc: RefLoc,
    },
    Area {
        class: PtgClass,
        area: AreaLoc,
    },
    /// Transient area marker: a precomputed constituent-range list for a
    /// reference subexpression. The subexpression bytes are carried verbatim;
    /// the range list lives in the trailing rgcb payload.
    MemArea {
        class: PtgClass,
        subex: Vec<u8>,
        ranges: Vec<Range>,
    },
    RefErr {
        class: PtgClass,
    },
    AreaErr {
        class: PtgClass,
    },
    Ref3d {
        class: PtgClass,
        ixti: u16,
        loc: RefLoc,
    },
    Area3d {
        class: PtgClass,
        ixti: u16,
        area: AreaLoc,
    },
    RefErr3d {
        class: PtgClass,
        ixti: u16,
    },
    AreaErr3d {
        class: PtgClass,
        ixti: u16,
    },
}

/// Errors decoding a single ptg from the primary rgce stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PtgDecodeError {
    #[error("rgce truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown ptg 0x{id:02X} at offset {offset}")]
    UnknownPtg { id: u8, offset: usize },
    #[error("unknown PtgAttr flags 0x{0:02X}")]
    UnknownAttr(u8),
    #[error("invalid error code 0x{0:02X} in PtgErr")]
    InvalidErrorCode(u8),
}

fn need(data: &[u8], pos: usize, len: usize) -> Result<&[u8], PtgDecodeError> {
    data.get(pos..pos + len).ok_or(PtgDecodeError::Truncated(pos))
}

fn rd_u16(data: &[u8], pos: usize) -> Result<u16, PtgDecodeError> {
    let b = need(data, pos, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn rd_u32(data: &[u8], pos: usize) -> Result<u32, PtgDecodeError> {
    let b = need(data, pos, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn rd_f64(data: &[u8], pos: usize) -> Result<f64, PtgDecodeError> {
    let b = need(data, pos, 8)?;
    Ok(f64::from_le_bytes(b.try_into().expect("8-byte slice")))
}

impl Ptg {
    /// Decode one token starting at `offset`, returning the token and the
    /// number of bytes consumed from the primary stream.
    pub fn decode(data: &[u8], offset: usize) -> Result<(Ptg, usize), PtgDecodeError> {
        let ptg_id = *data.get(offset).ok_or(PtgDecodeError::Truncated(offset))?;
        let pos = offset + 1;

        let simple = |ptg: Ptg| Ok((ptg, 1));

        match ptg_id {
            id::EXP => {
                let row = rd_u16(data, pos)?;
                let col = rd_u16(data, pos + 2)?;
                Ok((Ptg::Exp { row, col }, 5))
            }
            id::ADD => simple(Ptg::Add),
            id::SUB => simple(Ptg::Sub),
            id::MUL => simple(Ptg::Mul),
            id::DIV => simple(Ptg::Div),
            id::POWER => simple(Ptg::Power),
            id::CONCAT => simple(Ptg::Concat),
            id::LT => simple(Ptg::Lt),
            id::LE => simple(Ptg::Le),
            id::EQ => simple(Ptg::Eq),
            id::GE => simple(Ptg::Ge),
            id::GT => simple(Ptg::Gt),
            id::NE => simple(Ptg::Ne),
            id::ISECT => simple(Ptg::Isect),
            id::UNION => simple(Ptg::Union),
            id::RANGE => simple(Ptg::RangeOp),
            id::UNARY_PLUS => simple(Ptg::UnaryPlus),
            id::UNARY_MINUS => simple(Ptg::UnaryMinus),
            id::PERCENT => simple(Ptg::Percent),
            id::PAREN => simple(Ptg::Paren),
            id::MISSING_ARG => simple(Ptg::MissingArg),
            id::STR => {
                let (s, len) = decode_short_unicode_string(data, pos)?;
                Ok((Ptg::Str(s), 1 + len))
            }
            id::ATTR => {
                let (attr, len) = decode_attr(data, pos)?;
                Ok((Ptg::Attr(attr), 1 + len))
            }
            id::ERR => {
                let code = *need(data, pos, 1)?.first().expect("slice of 1");
                let err = ErrorValue::from_code(code)
                    .ok_or(PtgDecodeError::InvalidErrorCode(code))?;
                Ok((Ptg::Err(err), 2))
            }
            id::BOOL => {
                let b = *need(data, pos, 1)?.first().expect("slice of 1");
                Ok((Ptg::Bool(b != 0), 2))
            }
            id::INT => Ok((Ptg::Int(rd_u16(data, pos)?), 3)),
            id::NUM => Ok((Ptg::Num(rd_f64(data, pos)?), 9)),
            0x20..=0x7F => Self::decode_classed(data, offset, ptg_id),
            _ => Err(PtgDecodeError::UnknownPtg {
                id: ptg_id,
                offset,
            }),
        }
    }

    fn decode_classed(data: &[u8], offset: usize, ptg_id: u8) -> Result<(Ptg, usize), PtgDecodeError> {
        let class = PtgClass::from_id(ptg_id).expect("classed id range");
        let base = 0x20 | (ptg_id & 0x1F);
        let pos = offset + 1;

        match base {
            id::ARRAY => {
                // 7 reserved bytes; the element matrix lives in the rgcb.
                need(data, pos, 7)?;
                Ok((
                    Ptg::Array {
                        class,
                        literal: ArrayLiteral::default(),
                    },
                    8,
                ))
            }
            id::FUNC => Ok((
                Ptg::Func {
                    class,
                    iftab: rd_u16(data, pos)?,
                },
                3,
            )),
            id::FUNC_VAR => {
                let argc = *need(data, pos, 1)?.first().expect("slice of 1");
                let iftab = rd_u16(data, pos + 1)?;
                Ok((
                    Ptg::FuncVar {
                        class,
                        iftab,
                        // High bit of the argc byte flags a prompt-for-args
                        // macro function; not modeled.
                        argc: argc & 0x7F,
                    },
                    4,
                ))
            }
            id::NAME => {
                let iname = rd_u16(data, pos)?;
                // 4 reserved bytes follow the index.
                need(data, pos + 2, 4)?;
                Ok((Ptg::Name { class, iname }, 7))
            }
            id::REF => {
                let row = rd_u16(data, pos)?;
                let col_field = rd_u16(data, pos + 2)?;
                Ok((
                    Ptg::Ref {
                        class,
                        loc: RefLoc::from_wire(row, col_field),
                    },
                    5,
                ))
            }
            id::AREA => {
                let area = decode_area_body(data, pos)?;
                Ok((Ptg::Area { class, area }, 9))
            }
            id::MEM_AREA => {
                need(data, pos, 4)?; // unused
                let cce = rd_u16(data, pos + 4)? as usize;
                let subex = need(data, pos + 6, cce)?.to_vec();
                Ok((
                    Ptg::MemArea {
                        class,
                        subex,
                        ranges: Vec::new(),
                    },
                    7 + cce,
                ))
            }
            id::REF_ERR => {
                need(data, pos, 4)?; // stale address payload
                Ok((Ptg::RefErr { class }, 5))
            }
            id::AREA_ERR => {
                need(data, pos, 8)?;
                Ok((Ptg::AreaErr { class }, 9))
            }
            id::REF_3D => {
                let ixti = rd_u16(data, pos)?;
                let row = rd_u16(data, pos + 2)?;
                let col_field = rd_u16(data, pos + 4)?;
                Ok((
                    Ptg::Ref3d {
                        class,
                        ixti,
                        loc: RefLoc::from_wire(row, col_field),
                    },
                    7,
                ))
            }
            id::AREA_3D => {
                let ixti = rd_u16(data, pos)?;
                let area = decode_area_body(data, pos + 2)?;
                Ok((Ptg::Area3d { class, ixti, area }, 11))
            }
            id::REF_ERR_3D => {
                let ixti = rd_u16(data, pos)?;
                need(data, pos + 2, 4)?;
                Ok((Ptg::RefErr3d { class, ixti }, 7))
            }
            id::AREA_ERR_3D => {
                let ixti = rd_u16(data, pos)?;
                need(data, pos + 2, 8)?;
                Ok((Ptg::AreaErr3d { class, ixti }, 11))
            }
            _ => Err(PtgDecodeError::UnknownPtg {
                id: ptg_id,
                offset,
            }),
        }
    }

    /// Append the token's primary-stream encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Ptg::Exp { row, col } => {
                out.push(id::EXP);
                out.extend_from_slice(&row.to_le_bytes());
                out.extend_from_slice(&col.to_le_bytes());
            }
            Ptg::Add => out.push(id::ADD),
            Ptg::Sub => out.push(id::SUB),
            Ptg::Mul => out.push(id::MUL),
            Ptg::Div => out.push(id::DIV),
            Ptg::Power => out.push(id::POWER),
            Ptg::Concat => out.push(id::CONCAT),
            Ptg::Lt => out.push(id::LT),
            Ptg::Le => out.push(id::LE),
            Ptg::Eq => out.push(id::EQ),
            Ptg::Ge => out.push(id::GE),
            Ptg::Gt => out.push(id::GT),
            Ptg::Ne => out.push(id::NE),
            Ptg::Isect => out.push(id::ISECT),
            Ptg::Union => out.push(id::UNION),
            Ptg::RangeOp => out.push(id::RANGE),
            Ptg::UnaryPlus => out.push(id::UNARY_PLUS),
            Ptg::UnaryMinus => out.push(id::UNARY_MINUS),
            Ptg::Percent => out.push(id::PERCENT),
            Ptg::Paren => out.push(id::PAREN),
            Ptg::MissingArg => out.push(id::MISSING_ARG),
            Ptg::Str(s) => {
                out.push(id::STR);
                encode_short_unicode_string(s, out);
            }
            Ptg::Attr(attr) => encode_attr(attr, out),
            Ptg::Err(e) => {
                out.push(id::ERR);
                out.push(e.code());
            }
            Ptg::Bool(b) => {
                out.push(id::BOOL);
                out.push(u8::from(*b));
            }
            Ptg::Int(n) => {
                out.push(id::INT);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Ptg::Num(n) => {
                out.push(id::NUM);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Ptg::Array { class, .. } => {
                out.push(id::ARRAY + class.id_offset());
                out.extend_from_slice(&[0u8; 7]);
            }
            Ptg::Func { class, iftab } => {
                out.push(id::FUNC + class.id_offset());
                out.extend_from_slice(&iftab.to_le_bytes());
            }
            Ptg::FuncVar { class, iftab, argc } => {
                out.push(id::FUNC_VAR + class.id_offset());
                out.push(*argc);
                out.extend_from_slice(&iftab.to_le_bytes());
            }
            Ptg::Name { class, iname } => {
                out.push(id::NAME + class.id_offset());
                out.extend_from_slice(&iname.to_le_bytes());
                out.extend_from_slice(&[0u8; 4]);
            }
            Ptg::Ref { class, loc } => {
                out.push(id::REF + class.id_offset());
                encode_ref_body(loc, out);
            }
            Ptg::Area { class, area } => {
                out.push(id::AREA + class.id_offset());
                encode_area_body(area, out);
            }
            Ptg::MemArea { class, subex, .. } => {
                out.push(id::MEM_AREA + class.id_offset());
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&(subex.len() as u16).to_le_bytes());
                out.extend_from_slice(subex);
            }
            Ptg::RefErr { class } => {
                out.push(id::REF_ERR + class.id_offset());
                out.extend_from_slice(&[0u8; 4]);
            }
            Ptg::AreaErr { class } => {
                out.push(id::AREA_ERR + class.id_offset());
                out.extend_from_slice(&[0u8; 8]);
            }
            Ptg::Ref3d { class, ixti, loc } => {
                out.push(id::REF_3D + class.id_offset());
                out.extend_from_slice(&ixti.to_le_bytes());
                encode_ref_body(loc, out);
            }
            Ptg::Area3d { class, ixti, area } => {
                out.push(id::AREA_3D + class.id_offset());
                out.extend_from_slice(&ixti.to_le_bytes());
                encode_area_body(area, out);
            }
            Ptg::RefErr3d { class, ixti } => {
                out.push(id::REF_ERR_3D + class.id_offset());
                out.extend_from_slice(&ixti.to_le_bytes());
                out.extend_from_slice(&[0u8; 4]);
            }
            Ptg::AreaErr3d { class, ixti } => {
                out.push(id::AREA_ERR_3D + class.id_offset());
                out.extend_from_slice(&ixti.to_le_bytes());
                out.extend_from_slice(&[0u8; 8]);
            }
        }
    }

    /// Encoded length in the primary stream.
    pub fn encoded_len(&self) -> usize {
        // Cheap enough to compute by encoding; tokens are small.
        let mut buf = Vec::with_capacity(16);
        self.encode(&mut buf);
        buf.len()
    }

    /// True when this token owns a slice of the trailing rgcb payload.
    pub fn has_rgcb(&self) -> bool {
        matches!(self, Ptg::Array { .. } | Ptg::MemArea { .. })
    }

    /// Consume this token's share of the trailing rgcb payload.
    ///
    /// On truncation the token is left with an empty literal/range list and
    /// the error is returned for the caller to log; parsing of later tokens
    /// continues.
    pub fn read_rgcb(&mut self, rgcb: &[u8], cursor: &mut usize) -> Result<(), PtgDecodeError> {
        match self {
            Ptg::Array { literal, .. } => {
                let (lit, consumed) = decode_extra_array(rgcb, *cursor)?;
                *literal = lit;
                *cursor += consumed;
                Ok(())
            }
            Ptg::MemArea { ranges, .. } => {
                let (list, consumed) = decode_extra_mem(rgcb, *cursor)?;
                *ranges = list;
                *cursor += consumed;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Append this token's trailing rgcb payload. Writers rebuild the rgcb
    /// from scratch, in token order, on every serialization.
    pub fn write_rgcb(&self, out: &mut Vec<u8>) {
        match self {
            Ptg::Array { literal, .. } => encode_extra_array(literal, out),
            Ptg::MemArea { ranges, .. } => encode_extra_mem(ranges, out),
            _ => {}
        }
    }

    /// `(pops, pushes)` for the operand-stack discipline check, or `None`
    /// when the token does not touch the stack in a way known statically
    /// (unknown function id).
    pub fn stack_effect(&self) -> Option<(usize, usize)> {
        use crate::ftab;
        match self {
            Ptg::Add
            | Ptg::Sub
            | Ptg::Mul
            | Ptg::Div
            | Ptg::Power
            | Ptg::Concat
            | Ptg::Lt
            | Ptg::Le
            | Ptg::Eq
            | Ptg::Ge
            | Ptg::Gt
            | Ptg::Ne
            | Ptg::Isect
            | Ptg::Union
            | Ptg::RangeOp => Some((2, 1)),
            Ptg::UnaryPlus | Ptg::UnaryMinus | Ptg::Percent | Ptg::Paren => Some((1, 1)),
            Ptg::Attr(Attr::Sum) => Some((1, 1)),
            Ptg::Attr(_) => Some((0, 0)),
            Ptg::Func { iftab, .. } => {
                let spec = ftab::function_spec_from_id(*iftab)?;
                Some((spec.min_args as usize, 1))
            }
            Ptg::FuncVar { argc, .. } => Some((*argc as usize, 1)),
            _ => Some((0, 1)),
        }
    }

    /// Ranges denoted by this token (empty for non-reference tokens).
    pub fn referenced_ranges(&self) -> Vec<Range> {
        match self {
            Ptg::Ref { loc, .. } | Ptg::Ref3d { loc, .. } => vec![Range::single(loc.cell())],
            Ptg::Area { area, .. } | Ptg::Area3d { area, .. } => vec![area.range()],
            Ptg::MemArea { ranges, .. } => ranges.clone(),
            _ => Vec::new(),
        }
    }
}

fn decode_area_body(data: &[u8], pos: usize) -> Result<AreaLoc, PtgDecodeError> {
    let row_first = rd_u16(data, pos)?;
    let row_last = rd_u16(data, pos + 2)?;
    let col_first = rd_u16(data, pos + 4)?;
    let col_last = rd_u16(data, pos + 6)?;
    Ok(AreaLoc::new(
        RefLoc::from_wire(row_first, col_first),
        RefLoc::from_wire(row_last, col_last),
    ))
}

fn encode_ref_body(loc: &RefLoc, out: &mut Vec<u8>) {
    out.extend_from_slice(&loc.row.to_le_bytes());
    out.extend_from_slice(&loc.col_field().to_le_bytes());
}

fn encode_area_body(area: &AreaLoc, out: &mut Vec<u8>) {
    out.extend_from_slice(&area.first.row.to_le_bytes());
    out.extend_from_slice(&area.last.row.to_le_bytes());
    out.extend_from_slice(&area.first.col_field().to_le_bytes());
    out.extend_from_slice(&area.last.col_field().to_le_bytes());
}

fn decode_attr(data: &[u8], pos: usize) -> Result<(Attr, usize), PtgDecodeError> {
    let grbit = *need(data, pos, 1)?.first().expect("slice of 1");
    let w = rd_u16(data, pos + 1)?;
    match grbit {
        ATTR_SEMI => Ok((Attr::Semi, 3)),
        ATTR_IF => Ok((Attr::If { skip: w }, 3)),
        ATTR_GOTO => Ok((Attr::Goto { skip: w }, 3)),
        ATTR_SUM => Ok((Attr::Sum, 3)),
        ATTR_CHOOSE => {
            let mut jumps = Vec::with_capacity(w as usize);
            for i in 0..w as usize {
                jumps.push(rd_u16(data, pos + 3 + i * 2)?);
            }
            Ok((Attr::Choose { jumps }, 3 + w as usize * 2))
        }
        ATTR_SPACE => {
            let bytes = w.to_le_bytes();
            Ok((
                Attr::Space {
                    kind: bytes[0],
                    count: bytes[1],
                },
                3,
            ))
        }
        other => Err(PtgDecodeError::UnknownAttr(other)),
    }
}

fn encode_attr(attr: &Attr, out: &mut Vec<u8>) {
    out.push(id::ATTR);
    match attr {
        Attr::Semi => {
            out.push(ATTR_SEMI);
            out.extend_from_slice(&0u16.to_le_bytes());
        }
        Attr::If { skip } => {
            out.push(ATTR_IF);
            out.extend_from_slice(&skip.to_le_bytes());
        }
        Attr::Goto { skip } => {
            out.push(ATTR_GOTO);
            out.extend_from_slice(&skip.to_le_bytes());
        }
        Attr::Sum => {
            out.push(ATTR_SUM);
            out.extend_from_slice(&0u16.to_le_bytes());
        }
        Attr::Choose { jumps } => {
            out.push(ATTR_CHOOSE);
            out.extend_from_slice(&(jumps.len() as u16).to_le_bytes());
            for j in jumps {
                out.extend_from_slice(&j.to_le_bytes());
            }
        }
        Attr::Space { kind, count } => {
            out.push(ATTR_SPACE);
            out.push(*kind);
            out.push(*count);
        }
    }
}

/// ShortXLUnicodeString: `[cch:u8][flags:u8][chars]` with optional rich-run
/// and extension segments (skipped on decode, never written on encode).
fn decode_short_unicode_string(data: &[u8], pos: usize) -> Result<(String, usize), PtgDecodeError> {
    let header = need(data, pos, 2)?;
    let cch = header[0] as usize;
    let flags = header[1];
    let mut offset = pos + 2;

    let rich_runs = if flags & 0x08 != 0 {
        let runs = rd_u16(data, offset)? as usize;
        offset += 2;
        runs
    } else {
        0
    };
    let ext_size = if flags & 0x04 != 0 {
        let size = rd_u32(data, offset)? as usize;
        offset += 4;
        size
    } else {
        0
    };

    let s = if flags & 0x01 != 0 {
        let bytes = need(data, offset, cch * 2)?;
        offset += cch * 2;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        let bytes = need(data, offset, cch)?;
        offset += cch;
        // Compressed chars are Latin-1.
        bytes.iter().map(|&b| b as char).collect()
    };

    let skip = rich_runs * 4 + ext_size;
    need(data, offset, skip)?;
    offset += skip;

    Ok((s, offset - pos))
}

fn encode_short_unicode_string(s: &str, out: &mut Vec<u8>) {
    if s.chars().all(|c| (c as u32) < 0x100) {
        out.push(s.chars().count() as u8);
        out.push(0x00);
        out.extend(s.chars().map(|c| c as u8));
    } else {
        let units: Vec<u16> = s.encode_utf16().collect();
        out.push(units.len() as u8);
        out.push(0x01);
        for u in units {
            out.extend_from_slice(&u.to_le_bytes());
        }
    }
}

// --- trailing rgcb payloads -------------------------------------------------

/// PtgExtraArray: `[cols-1:u8][rows-1:u16]` then SerAr-tagged elements,
/// row-major.
fn decode_extra_array(rgcb: &[u8], pos: usize) -> Result<(ArrayLiteral, usize), PtgDecodeError> {
    let header = need(rgcb, pos, 3)?;
    let cols = header[0] as u16 + 1;
    let rows = u16::from_le_bytes([header[1], header[2]]) + 1;
    let mut offset = pos + 3;

    let count = rows as usize * cols as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = *need(rgcb, offset, 1)?.first().expect("slice of 1");
        offset += 1;
        let value = match tag {
            0x00 => {
                need(rgcb, offset, 8)?;
                offset += 8;
                CellValue::Empty
            }
            0x01 => {
                let n = rd_f64(rgcb, offset)?;
                offset += 8;
                CellValue::Number(n)
            }
            0x02 => {
                // XLUnicodeString: [cch:u16][flags:u8][chars].
                let cch = rd_u16(rgcb, offset)? as usize;
                let flags = *need(rgcb, offset + 2, 1)?.first().expect("slice of 1");
                offset += 3;
                let s = if flags & 0x01 != 0 {
                    let bytes = need(rgcb, offset, cch * 2)?;
                    offset += cch * 2;
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                    String::from_utf16_lossy(&units)
                } else {
                    let bytes = need(rgcb, offset, cch)?;
                    offset += cch;
                    bytes.iter().map(|&b| b as char).collect()
                };
                CellValue::Text(s)
            }
            0x04 => {
                let b = need(rgcb, offset, 8)?;
                offset += 8;
                CellValue::Boolean(b[0] != 0)
            }
            0x10 => {
                let b = need(rgcb, offset, 8)?;
                offset += 8;
                match ErrorValue::from_code(b[0]) {
                    Some(e) => CellValue::Error(e),
                    None => return Err(PtgDecodeError::InvalidErrorCode(b[0])),
                }
            }
            other => {
                return Err(PtgDecodeError::UnknownPtg {
                    id: other,
                    offset: offset - 1,
                })
            }
        };
        values.push(value);
    }

    Ok((ArrayLiteral { rows, cols, values }, offset - pos))
}

fn encode_extra_array(literal: &ArrayLiteral, out: &mut Vec<u8>) {
    // A truncated-on-read literal re-serializes as a 1x1 empty array so the
    // payload stays structurally valid.
    let (rows, cols) = if literal.is_empty() {
        (1u16, 1u16)
    } else {
        (literal.rows, literal.cols)
    };
    out.push((cols - 1) as u8);
    out.extend_from_slice(&(rows - 1).to_le_bytes());

    let count = rows as usize * cols as usize;
    for i in 0..count {
        match literal.values.get(i).unwrap_or(&CellValue::Empty) {
            CellValue::Empty => {
                out.push(0x00);
                out.extend_from_slice(&[0u8; 8]);
            }
            CellValue::Number(n) => {
                out.push(0x01);
                out.extend_from_slice(&n.to_le_bytes());
            }
            CellValue::Text(s) => {
                out.push(0x02);
                if s.chars().all(|c| (c as u32) < 0x100) {
                    out.extend_from_slice(&(s.chars().count() as u16).to_le_bytes());
                    out.push(0x00);
                    out.extend(s.chars().map(|c| c as u8));
                } else {
                    let units: Vec<u16> = s.encode_utf16().collect();
                    out.extend_from_slice(&(units.len() as u16).to_le_bytes());
                    out.push(0x01);
                    for u in units {
                        out.extend_from_slice(&u.to_le_bytes());
                    }
                }
            }
            CellValue::Boolean(b) => {
                out.push(0x04);
                out.push(u8::from(*b));
                out.extend_from_slice(&[0u8; 7]);
            }
            CellValue::Error(e) => {
                out.push(0x10);
                out.push(e.code());
                out.extend_from_slice(&[0u8; 7]);
            }
        }
    }
}

/// PtgExtraMem: `[count:u16]` then `count` Ref8U rectangles
/// (`[rwFirst:u16][rwLast:u16][colFirst:u16][colLast:u16]`).
fn decode_extra_mem(rgcb: &[u8], pos: usize) -> Result<(Vec<Range>, usize), PtgDecodeError> {
    let count = rd_u16(rgcb, pos)? as usize;
    let mut offset = pos + 2;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let row_first = rd_u16(rgcb, offset)?;
        let row_last = rd_u16(rgcb, offset + 2)?;
        let col_first = rd_u16(rgcb, offset + 4)? & COL_INDEX_MASK;
        let col_last = rd_u16(rgcb, offset + 6)? & COL_INDEX_MASK;
        offset += 8;
        ranges.push(Range::new(
            CellRef::new(row_first as u32, col_first as u32),
            CellRef::new(row_last as u32, col_last as u32),
        ));
    }
    Ok((ranges, offset - pos))
}

fn encode_extra_mem(ranges: &[Range], out: &mut Vec<u8>) {
    out.extend_from_slice(&(ranges.len() as u16).to_le_bytes());
    for r in ranges {
        out.extend_from_slice(&(r.start.row as u16).to_le_bytes());
        out.extend_from_slice(&(r.end.row as u16).to_le_bytes());
        out.extend_from_slice(&(r.start.col as u16).to_le_bytes());
        out.extend_from_slice(&(r.end.col as u16).to_le_bytes());
    }
}

/// Literal used in formula text for things like `{1,2;3,4}`.
pub fn array_literal_text(literal: &ArrayLiteral) -> String {
    if literal.is_empty() {
        return "{}".to_string();
    }
    let mut rows_text = Vec::with_capacity(literal.rows as usize);
    for r in 0..literal.rows as usize {
        let row: Vec<String> = (0..literal.cols as usize)
            .map(|c| match literal.get(r, c) {
                Some(CellValue::Text(s)) => format!("\"{}\"", s.replace('"', "\"\"")),
                Some(v) => v.display(),
                None => String::new(),
            })
            .collect();
        rows_text.push(row.join(","));
    }
    format!("{{{}}}", rows_text.join(";"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(ptg: Ptg) {
        let mut rgce = Vec::new();
        ptg.encode(&mut rgce);
        let mut rgcb = Vec::new();
        ptg.write_rgcb(&mut rgcb);

        let (mut decoded, consumed) = Ptg::decode(&rgce, 0).expect("decode");
        assert_eq!(consumed, rgce.len());
        let mut cursor = 0usize;
        decoded.read_rgcb(&rgcb, &mut cursor).expect("rgcb");
        assert_eq!(cursor, rgcb.len());
        assert_eq!(decoded, ptg);
    }

    #[test]
    fn operator_and_literal_roundtrip() {
        roundtrip(Ptg::Add);
        roundtrip(Ptg::RangeOp);
        roundtrip(Ptg::MissingArg);
        roundtrip(Ptg::Int(42));
        roundtrip(Ptg::Num(2.5));
        roundtrip(Ptg::Bool(true));
        roundtrip(Ptg::Err(ErrorValue::Div0));
        roundtrip(Ptg::Str("hello".to_string()));
        roundtrip(Ptg::Str("snowman \u{2603}".to_string()));
        roundtrip(Ptg::Exp { row: 5, col: 0 });
    }

    #[test]
    fn reference_roundtrip_preserves_flags() {
        for (row_rel, col_rel) in [(false, false), (true, false), (false, true), (true, true)] {
            roundtrip(Ptg::Ref {
                class: PtgClass::Value,
                loc: RefLoc::new(7, 3, row_rel, col_rel),
            });
        }
        roundtrip(Ptg::Area {
            class: PtgClass::Reference,
            area: AreaLoc::new(RefLoc::new(0, 0, true, true), RefLoc::new(9, 1, false, false)),
        });
        roundtrip(Ptg::Ref3d {
            class: PtgClass::Value,
            ixti: 2,
            loc: RefLoc::new(3, 3, true, true),
        });
        roundtrip(Ptg::Area3d {
            class: PtgClass::Array,
            ixti: 1,
            area: AreaLoc::new(RefLoc::new(0, 0, false, false), RefLoc::new(4, 4, false, false)),
        });
    }

    #[test]
    fn classed_ids_use_parallel_ranges() {
        let mut out = Vec::new();
        Ptg::Ref {
            class: PtgClass::Array,
            loc: RefLoc::new(0, 0, true, true),
        }
        .encode(&mut out);
        assert_eq!(out[0], 0x64);
        out.clear();
        Ptg::FuncVar {
            class: PtgClass::Value,
            iftab: crate::ftab::iftab::SUM,
            argc: 1,
        }
        .encode(&mut out);
        assert_eq!(out[0], 0x42);
    }

    #[test]
    fn array_literal_roundtrip_via_rgcb() {
        roundtrip(Ptg::Array {
            class: PtgClass::Array,
            literal: ArrayLiteral::new(
                2,
                2,
                vec![
                    CellValue::Number(1.0),
                    CellValue::Text("x".to_string()),
                    CellValue::Boolean(false),
                    CellValue::Error(ErrorValue::NA),
                ],
            ),
        });
    }

    #[test]
    fn mem_area_roundtrip_via_rgcb() {
        roundtrip(Ptg::MemArea {
            class: PtgClass::Reference,
            subex: vec![],
            ranges: vec![
                Range::from_a1("A1:B2").unwrap(),
                Range::from_a1("D4").unwrap(),
            ],
        });
    }

    #[test]
    fn attr_variants_roundtrip() {
        roundtrip(Ptg::Attr(Attr::Semi));
        roundtrip(Ptg::Attr(Attr::Sum));
        roundtrip(Ptg::Attr(Attr::If { skip: 9 }));
        roundtrip(Ptg::Attr(Attr::Goto { skip: 12 }));
        roundtrip(Ptg::Attr(Attr::Choose { jumps: vec![4, 8, 15] }));
        roundtrip(Ptg::Attr(Attr::Space { kind: 0, count: 3 }));
    }

    #[test]
    fn truncated_primary_stream_is_fatal() {
        // PtgNum announces 8 payload bytes but only 3 follow.
        let data = [0x1F, 0x00, 0x00, 0x00];
        assert!(matches!(
            Ptg::decode(&data, 0),
            Err(PtgDecodeError::Truncated(_))
        ));
    }

    #[test]
    fn unknown_ptg_is_reported_with_offset() {
        let err = Ptg::decode(&[0x00], 0).unwrap_err();
        assert_eq!(err, PtgDecodeError::UnknownPtg { id: 0x00, offset: 0 });
    }
}

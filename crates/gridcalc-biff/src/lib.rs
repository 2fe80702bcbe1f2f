//! BIFF8 formula token stream (`rgce`) support.
//!
//! This crate provides:
//! - the `Ptg` token model, with per-token byte encode/decode and the
//!   trailing-payload (`rgcb`) contract for array literals and area markers
//! - `parse_rgce` / `encode_rgce`: ordered token sequences <-> bytes
//! - `render_text`: best-effort lowering of a postfix token sequence to
//!   human-readable formula text
//! - the payload layouts of the FORMULA / ARRAY / SHRFMLA records
//! - the curated Ftab function table used by `PtgFunc` / `PtgFuncVar`
//!
//! Record framing (opcode + length + CONTINUE reassembly) and the cell
//! object model live in collaborating crates.

pub mod ftab;
mod ptg;
pub mod records;
mod rgce;

pub use ftab::{function_name_from_id, function_spec_from_id, function_spec_from_name, FuncSpec};
pub use ptg::{array_literal_text, Attr, ArrayLiteral, AreaLoc, Ptg, PtgClass, PtgDecodeError, RefLoc};
pub use records::{ArrayRecord, CachedValue, FormulaRecord, RecordError, ShrFmlaRecord};
pub use rgce::{
    check_stack_discipline, encode_rgce, parse_rgce, referenced_ranges, render_text, EncodedRgce,
    ParsedRgce, RenderContext, RgceError,
};

//! `gridcalc-model` defines the core addressing and value types shared by the
//! BIFF codec and the calculation engine.
//!
//! The crate is intentionally self-contained (no I/O, no engine logic) so it
//! can be reused by:
//! - the rgce token codec (`gridcalc-biff`)
//! - the evaluator / reference tracker (`gridcalc-engine`)
//! - embedding applications via `serde`

mod address;
mod calc;
mod names;
mod value;

pub use address::{col_to_name, name_to_col, A1ParseError, CellRef, Range};
pub use calc::CalcMode;
pub use names::{DefinedName, NameDefinition, NameTable};
pub use value::{format_number, CellValue, ErrorValue};

/// BIFF8 sheet row limit (0-indexed rows `0..=65535`).
pub const MAX_ROWS: u32 = 65_536;
/// BIFF8 sheet column limit (0-indexed columns `0..=255`).
pub const MAX_COLS: u32 = 256;

//! Calculation engine over the `gridcalc-biff` token model.
//!
//! The engine is built from five collaborators:
//! - [`eval`]: the postfix stack machine (operand coercion, implicit
//!   intersection, the built-in function set, recursion-bounded
//!   circular-reference detection)
//! - [`text`]: user-entered formula text -> postfix tokens
//! - [`tracker`]: the reference registry that keeps tokens consistent under
//!   row/column insertion and deletion
//! - [`shared`] and [`array`]: one-expression-many-cells bindings (shared
//!   formulas instantiate per member; array formulas share a result matrix)
//! - [`workbook`]: cell storage, the calculation cache, and the calc-mode
//!   policy tying the rest together

pub mod array;
pub mod eval;
pub mod shared;
pub mod text;
pub mod tracker;
pub mod workbook;

pub use array::{ArrayFormula, Matrix};
pub use eval::{evaluate, evaluate_matrix, CellResolver, EvalContext, EvalError,
    DEFAULT_MAX_RECURSION};
pub use shared::{materialize_tokens, SharedFormulaError, SharedFormulaHost, SharedFormulaManager};
pub use text::{parse_formula_text, FormulaParseError};
pub use tracker::{
    LocationPolicy, RefId, RefOutcome, RefUpdate, ReferenceTracker, SheetId, ShiftPolicy,
    StructuralChange, TrackedRef,
};
pub use workbook::{Sheet, Workbook, WorkbookError};

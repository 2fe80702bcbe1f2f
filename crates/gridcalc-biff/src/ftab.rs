//! BIFF function table (Ftab) subset.
//!
//! Built-in functions are encoded in tokenized BIFF formulas using a 16-bit
//! function identifier (`iftab`) in `PtgFunc` / `PtgFuncVar` tokens. The
//! identifiers below are the real BIFF function codes from the Microsoft
//! Office binary file format documentation; this crate carries only the
//! curated subset the evaluator implements.
//!
//! Fixed-arity functions encode as `PtgFunc` (no argument-count byte);
//! variable-arity functions encode as `PtgFuncVar`.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Argument-count contract for a built-in function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncSpec {
    pub name: &'static str,
    pub iftab: u16,
    pub min_args: u8,
    pub max_args: u8,
}

impl FuncSpec {
    /// Fixed-arity functions encode as `PtgFunc`.
    pub fn is_fixed_arity(&self) -> bool {
        self.min_args == self.max_args
    }
}

const fn spec(name: &'static str, iftab: u16, min_args: u8, max_args: u8) -> FuncSpec {
    FuncSpec {
        name,
        iftab,
        min_args,
        max_args,
    }
}

/// Maximum argument count for a `PtgFuncVar` token.
pub const MAX_FUNC_ARGS: u8 = 30;

/// Function ids used by `PtgFunc`/`PtgFuncVar` tokens.
pub mod iftab {
    pub const COUNT: u16 = 0;
    pub const IF: u16 = 1;
    pub const ISNA: u16 = 2;
    pub const ISERROR: u16 = 3;
    pub const SUM: u16 = 4;
    pub const AVERAGE: u16 = 5;
    pub const MIN: u16 = 6;
    pub const MAX: u16 = 7;
    pub const ROW: u16 = 8;
    pub const COLUMN: u16 = 9;
    pub const NA: u16 = 10;
    pub const PI: u16 = 19;
    pub const SQRT: u16 = 20;
    pub const EXP: u16 = 21;
    pub const LN: u16 = 22;
    pub const LOG10: u16 = 23;
    pub const ABS: u16 = 24;
    pub const INT: u16 = 25;
    pub const SIGN: u16 = 26;
    pub const ROUND: u16 = 27;
    pub const MID: u16 = 31;
    pub const LEN: u16 = 32;
    pub const VALUE: u16 = 33;
    pub const TRUE: u16 = 34;
    pub const FALSE: u16 = 35;
    pub const AND: u16 = 36;
    pub const OR: u16 = 37;
    pub const NOT: u16 = 38;
    pub const MOD: u16 = 39;
    pub const CHOOSE: u16 = 100;
    pub const LOWER: u16 = 112;
    pub const UPPER: u16 = 113;
    pub const LEFT: u16 = 115;
    pub const RIGHT: u16 = 116;
    pub const TRIM: u16 = 118;
    pub const ISTEXT: u16 = 127;
    pub const ISNUMBER: u16 = 128;
    pub const ISBLANK: u16 = 129;
    pub const COUNTA: u16 = 169;
    pub const PRODUCT: u16 = 183;
    pub const ROUNDUP: u16 = 212;
    pub const ROUNDDOWN: u16 = 213;
    pub const CONCATENATE: u16 = 336;
    pub const POWER: u16 = 337;
}

/// The curated function table.
pub const FTAB: &[FuncSpec] = &[
    spec("COUNT", iftab::COUNT, 1, MAX_FUNC_ARGS),
    spec("IF", iftab::IF, 2, 3),
    spec("ISNA", iftab::ISNA, 1, 1),
    spec("ISERROR", iftab::ISERROR, 1, 1),
    spec("SUM", iftab::SUM, 1, MAX_FUNC_ARGS),
    spec("AVERAGE", iftab::AVERAGE, 1, MAX_FUNC_ARGS),
    spec("MIN", iftab::MIN, 1, MAX_FUNC_ARGS),
    spec("MAX", iftab::MAX, 1, MAX_FUNC_ARGS),
    spec("ROW", iftab::ROW, 0, 1),
    spec("COLUMN", iftab::COLUMN, 0, 1),
    spec("NA", iftab::NA, 0, 0),
    spec("PI", iftab::PI, 0, 0),
    spec("SQRT", iftab::SQRT, 1, 1),
    spec("EXP", iftab::EXP, 1, 1),
    spec("LN", iftab::LN, 1, 1),
    spec("LOG10", iftab::LOG10, 1, 1),
    spec("ABS", iftab::ABS, 1, 1),
    spec("INT", iftab::INT, 1, 1),
    spec("SIGN", iftab::SIGN, 1, 1),
    spec("ROUND", iftab::ROUND, 2, 2),
    spec("MID", iftab::MID, 3, 3),
    spec("LEN", iftab::LEN, 1, 1),
    spec("VALUE", iftab::VALUE, 1, 1),
    spec("TRUE", iftab::TRUE, 0, 0),
    spec("FALSE", iftab::FALSE, 0, 0),
    spec("AND", iftab::AND, 1, MAX_FUNC_ARGS),
    spec("OR", iftab::OR, 1, MAX_FUNC_ARGS),
    spec("NOT", iftab::NOT, 1, 1),
    spec("MOD", iftab::MOD, 2, 2),
    spec("CHOOSE", iftab::CHOOSE, 2, MAX_FUNC_ARGS),
    spec("LOWER", iftab::LOWER, 1, 1),
    spec("UPPER", iftab::UPPER, 1, 1),
    spec("LEFT", iftab::LEFT, 1, 2),
    spec("RIGHT", iftab::RIGHT, 1, 2),
    spec("TRIM", iftab::TRIM, 1, 1),
    spec("ISTEXT", iftab::ISTEXT, 1, 1),
    spec("ISNUMBER", iftab::ISNUMBER, 1, 1),
    spec("ISBLANK", iftab::ISBLANK, 1, 1),
    spec("COUNTA", iftab::COUNTA, 1, MAX_FUNC_ARGS),
    spec("PRODUCT", iftab::PRODUCT, 1, MAX_FUNC_ARGS),
    spec("ROUNDUP", iftab::ROUNDUP, 2, 2),
    spec("ROUNDDOWN", iftab::ROUNDDOWN, 2, 2),
    spec("CONCATENATE", iftab::CONCATENATE, 1, MAX_FUNC_ARGS),
    spec("POWER", iftab::POWER, 2, 2),
];

fn by_id() -> &'static HashMap<u16, &'static FuncSpec> {
    static MAP: OnceLock<HashMap<u16, &'static FuncSpec>> = OnceLock::new();
    MAP.get_or_init(|| FTAB.iter().map(|s| (s.iftab, s)).collect())
}

fn by_name() -> &'static HashMap<&'static str, &'static FuncSpec> {
    static MAP: OnceLock<HashMap<&'static str, &'static FuncSpec>> = OnceLock::new();
    MAP.get_or_init(|| FTAB.iter().map(|s| (s.name, s)).collect())
}

pub fn function_spec_from_id(iftab: u16) -> Option<&'static FuncSpec> {
    by_id().get(&iftab).copied()
}

/// Case-insensitive name lookup (function names are uppercased on the wire).
pub fn function_spec_from_name(name: &str) -> Option<&'static FuncSpec> {
    let upper = name.to_ascii_uppercase();
    by_name().get(upper.as_str()).copied()
}

pub fn function_name_from_id(iftab: u16) -> Option<&'static str> {
    function_spec_from_id(iftab).map(|s| s.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(function_spec_from_name("sum").unwrap().iftab, iftab::SUM);
        assert_eq!(function_spec_from_name("Concatenate").unwrap().iftab, 336);
        assert!(function_spec_from_name("NOSUCHFN").is_none());
    }

    #[test]
    fn table_has_no_duplicate_ids() {
        assert_eq!(by_id().len(), FTAB.len());
        assert_eq!(by_name().len(), FTAB.len());
    }

    #[test]
    fn fixed_arity_matches_encoding_choice() {
        assert!(function_spec_from_id(iftab::ABS).unwrap().is_fixed_arity());
        assert!(!function_spec_from_id(iftab::IF).unwrap().is_fixed_arity());
    }
}

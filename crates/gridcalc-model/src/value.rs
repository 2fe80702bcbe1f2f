use core::fmt;

use serde::{Deserialize, Serialize};

/// A computed or stored cell value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    /// Empty / unset cell value.
    Empty,
    /// IEEE-754 double precision number.
    Number(f64),
    /// Plain string.
    Text(String),
    /// Boolean.
    Boolean(bool),
    /// Formula error value (`#REF!`, `#DIV/0!`, ...).
    Error(ErrorValue),
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Empty
    }
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// Display form: booleans as `TRUE`/`FALSE`, numbers in their shortest
    /// exact representation, errors as their code string.
    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => format_number(*n),
            CellValue::Text(s) => s.clone(),
            CellValue::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            CellValue::Error(e) => e.as_str().to_string(),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        CellValue::Text(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

impl From<ErrorValue> for CellValue {
    fn from(value: ErrorValue) -> Self {
        CellValue::Error(value)
    }
}

/// Canonical textual form of a number (integers without a trailing `.0`).
pub fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        let mut s = format!("{n}");
        if s == "-0" {
            s = "0".to_string();
        }
        s
    }
}

/// Formula error values.
///
/// `Circular` is the engine's designated circular-reference result; the
/// remaining variants map 1:1 to the BIFF error codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorValue {
    /// `#NULL!` — empty range intersection.
    Null,
    /// `#DIV/0!`
    Div0,
    /// `#VALUE!` — wrong operand type.
    Value,
    /// `#REF!` — invalid or deleted reference.
    Ref,
    /// `#NAME?` — unresolved defined name or function name.
    Name,
    /// `#NUM!` — invalid numeric result.
    Num,
    /// `#N/A`
    NA,
    /// `#CIR_ERR!` — recursion-bounded circular reference.
    ///
    /// Not representable in BIFF; serialized with the `#REF!` code.
    Circular,
}

impl ErrorValue {
    /// BIFF error code byte.
    pub fn code(self) -> u8 {
        match self {
            ErrorValue::Null => 0x00,
            ErrorValue::Div0 => 0x07,
            ErrorValue::Value => 0x0F,
            ErrorValue::Ref | ErrorValue::Circular => 0x17,
            ErrorValue::Name => 0x1D,
            ErrorValue::Num => 0x24,
            ErrorValue::NA => 0x2A,
        }
    }

    /// Decode a BIFF error code byte.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ErrorValue::Null),
            0x07 => Some(ErrorValue::Div0),
            0x0F => Some(ErrorValue::Value),
            0x17 => Some(ErrorValue::Ref),
            0x1D => Some(ErrorValue::Name),
            0x24 => Some(ErrorValue::Num),
            0x2A => Some(ErrorValue::NA),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorValue::Null => "#NULL!",
            ErrorValue::Div0 => "#DIV/0!",
            ErrorValue::Value => "#VALUE!",
            ErrorValue::Ref => "#REF!",
            ErrorValue::Name => "#NAME?",
            ErrorValue::Num => "#NUM!",
            ErrorValue::NA => "#N/A",
            ErrorValue::Circular => "#CIR_ERR!",
        }
    }

    /// Recognize an error literal in formula text.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "#NULL!" => Some(ErrorValue::Null),
            "#DIV/0!" => Some(ErrorValue::Div0),
            "#VALUE!" => Some(ErrorValue::Value),
            "#REF!" => Some(ErrorValue::Ref),
            "#NAME?" => Some(ErrorValue::Name),
            "#NUM!" => Some(ErrorValue::Num),
            "#N/A" => Some(ErrorValue::NA),
            "#CIR_ERR!" => Some(ErrorValue::Circular),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn error_code_roundtrip() {
        for e in [
            ErrorValue::Null,
            ErrorValue::Div0,
            ErrorValue::Value,
            ErrorValue::Ref,
            ErrorValue::Name,
            ErrorValue::Num,
            ErrorValue::NA,
        ] {
            assert_eq!(ErrorValue::from_code(e.code()), Some(e));
        }
        // Circular degrades to #REF! on the wire.
        assert_eq!(ErrorValue::from_code(ErrorValue::Circular.code()), Some(ErrorValue::Ref));
    }

    #[test]
    fn number_display_is_canonical() {
        assert_eq!(format_number(2.0), "2");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(CellValue::Boolean(true).display(), "TRUE");
    }
}

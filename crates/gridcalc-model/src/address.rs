use core::fmt;

use serde::{Deserialize, Serialize};

/// A reference to a single cell within a worksheet.
///
/// Rows and columns are **0-indexed**:
/// - `row = 0` is displayed row `1`
/// - `col = 0` is displayed column `A`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    /// 0-indexed row.
    pub row: u32,
    /// 0-indexed column.
    pub col: u32,
}

impl CellRef {
    #[inline]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Convert to A1 notation (e.g. `A1`, `BC32`).
    pub fn to_a1(self) -> String {
        format!("{}{}", col_to_name(self.col), self.row + 1)
    }

    /// Parse an A1-style reference (e.g. `A1`, `$B$2`). `$` markers are
    /// accepted and discarded; relative/absolute flags live on formula
    /// tokens, not on addresses.
    pub fn from_a1(a1: &str) -> Result<Self, A1ParseError> {
        let (cell, rest) = parse_a1_prefix(a1.trim())?;
        if !rest.is_empty() {
            return Err(A1ParseError::TrailingCharacters);
        }
        Ok(cell)
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

/// A rectangular region within a worksheet.
///
/// The range is inclusive. Constructors normalize so that
/// `start.row <= end.row` and `start.col <= end.col`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: CellRef,
    pub end: CellRef,
}

impl Range {
    pub fn new(a: CellRef, b: CellRef) -> Self {
        let start = CellRef::new(a.row.min(b.row), a.col.min(b.col));
        let end = CellRef::new(a.row.max(b.row), a.col.max(b.col));
        Self { start, end }
    }

    /// A 1×1 range covering a single cell.
    pub fn single(cell: CellRef) -> Self {
        Self {
            start: cell,
            end: cell,
        }
    }

    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    /// Number of rows spanned (inclusive).
    pub fn rows(&self) -> u32 {
        self.end.row - self.start.row + 1
    }

    /// Number of columns spanned (inclusive).
    pub fn cols(&self) -> u32 {
        self.end.col - self.start.col + 1
    }

    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row >= self.start.row
            && cell.row <= self.end.row
            && cell.col >= self.start.col
            && cell.col <= self.end.col
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains_range(&self, other: Range) -> bool {
        self.contains(other.start) && self.contains(other.end)
    }

    /// True when `self` and `other` share at least one cell.
    pub fn intersects(&self, other: Range) -> bool {
        self.start.row <= other.end.row
            && other.start.row <= self.end.row
            && self.start.col <= other.end.col
            && other.start.col <= self.end.col
    }

    /// Convert to A1 notation (`A1` for a single cell, `A1:B2` otherwise).
    pub fn to_a1(&self) -> String {
        if self.is_single_cell() {
            self.start.to_a1()
        } else {
            format!("{}:{}", self.start.to_a1(), self.end.to_a1())
        }
    }

    /// Parse `A1` or `A1:B2` notation.
    pub fn from_a1(a1: &str) -> Result<Self, A1ParseError> {
        let s = a1.trim();
        match s.split_once(':') {
            Some((first, second)) => {
                let start = CellRef::from_a1(first)?;
                let end = CellRef::from_a1(second)?;
                Ok(Range::new(start, end))
            }
            None => Ok(Range::single(CellRef::from_a1(s)?)),
        }
    }

    /// Iterate over all cells in the range, row-major.
    pub fn cells(&self) -> impl Iterator<Item = CellRef> + '_ {
        let (r0, r1) = (self.start.row, self.end.row);
        let (c0, c1) = (self.start.col, self.end.col);
        (r0..=r1).flat_map(move |row| (c0..=c1).map(move |col| CellRef::new(row, col)))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

impl From<CellRef> for Range {
    fn from(cell: CellRef) -> Self {
        Range::single(cell)
    }
}

/// Errors parsing A1-style cell/range text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum A1ParseError {
    #[error("empty reference")]
    Empty,
    #[error("missing column letters")]
    MissingColumn,
    #[error("missing row number")]
    MissingRow,
    #[error("column out of range")]
    InvalidColumn,
    #[error("row out of range")]
    InvalidRow,
    #[error("unexpected trailing characters")]
    TrailingCharacters,
}

/// Convert a 0-indexed column to its letter name (`0 -> A`, `27 -> AB`).
pub fn col_to_name(col: u32) -> String {
    let mut name = Vec::new();
    let mut n = col;
    loop {
        name.push(b'A' + (n % 26) as u8);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    name.reverse();
    // Only ASCII uppercase letters are pushed above.
    String::from_utf8(name).unwrap()
}

/// Convert a column letter name to its 0-indexed column (`A -> 0`).
pub fn name_to_col(name: &str) -> Result<u32, A1ParseError> {
    if name.is_empty() {
        return Err(A1ParseError::MissingColumn);
    }
    let mut col: u32 = 0;
    for b in name.bytes() {
        let d = match b {
            b'A'..=b'Z' => (b - b'A') as u32,
            b'a'..=b'z' => (b - b'a') as u32,
            _ => return Err(A1ParseError::InvalidColumn),
        };
        col = col
            .checked_mul(26)
            .and_then(|c| c.checked_add(d + 1))
            .ok_or(A1ParseError::InvalidColumn)?;
    }
    Ok(col - 1)
}

/// Parse a leading A1 cell reference, returning the rest of the input.
fn parse_a1_prefix(s: &str) -> Result<(CellRef, &str), A1ParseError> {
    if s.is_empty() {
        return Err(A1ParseError::Empty);
    }
    let bytes = s.as_bytes();
    let mut idx = 0usize;
    if bytes.get(idx) == Some(&b'$') {
        idx += 1;
    }
    let col_start = idx;
    while idx < bytes.len() && bytes[idx].is_ascii_alphabetic() {
        idx += 1;
    }
    if idx == col_start {
        return Err(A1ParseError::MissingColumn);
    }
    let col = name_to_col(&s[col_start..idx])?;
    if col >= crate::MAX_COLS {
        return Err(A1ParseError::InvalidColumn);
    }
    if bytes.get(idx) == Some(&b'$') {
        idx += 1;
    }
    let row_start = idx;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == row_start {
        return Err(A1ParseError::MissingRow);
    }
    let row_1_based: u32 = s[row_start..idx]
        .parse()
        .map_err(|_| A1ParseError::InvalidRow)?;
    if row_1_based == 0 || row_1_based > crate::MAX_ROWS {
        return Err(A1ParseError::InvalidRow);
    }
    Ok((CellRef::new(row_1_based - 1, col), &s[idx..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn a1_roundtrip() {
        for (row, col, text) in [(0, 0, "A1"), (31, 54, "BC32"), (65535, 255, "IV65536")] {
            let cell = CellRef::new(row, col);
            assert_eq!(cell.to_a1(), text);
            assert_eq!(CellRef::from_a1(text).unwrap(), cell);
        }
    }

    #[test]
    fn a1_accepts_dollar_markers() {
        assert_eq!(CellRef::from_a1("$B$2").unwrap(), CellRef::new(1, 1));
        assert_eq!(CellRef::from_a1("$B2").unwrap(), CellRef::new(1, 1));
        assert_eq!(CellRef::from_a1("B$2").unwrap(), CellRef::new(1, 1));
    }

    #[test]
    fn a1_rejects_garbage() {
        assert_eq!(CellRef::from_a1(""), Err(A1ParseError::Empty));
        assert_eq!(CellRef::from_a1("123"), Err(A1ParseError::MissingColumn));
        assert_eq!(CellRef::from_a1("A"), Err(A1ParseError::MissingRow));
        assert_eq!(CellRef::from_a1("A0"), Err(A1ParseError::InvalidRow));
        assert_eq!(CellRef::from_a1("A1X"), Err(A1ParseError::TrailingCharacters));
        // BIFF8 only has 256 columns.
        assert_eq!(CellRef::from_a1("IW1"), Err(A1ParseError::InvalidColumn));
    }

    #[test]
    fn range_normalizes_and_contains() {
        let r = Range::from_a1("C3:A1").unwrap();
        assert_eq!(r.to_a1(), "A1:C3");
        assert_eq!((r.rows(), r.cols()), (3, 3));
        assert!(r.contains(CellRef::new(1, 1)));
        assert!(!r.contains(CellRef::new(3, 0)));
        assert!(r.intersects(Range::from_a1("C3:D4").unwrap()));
        assert!(!r.intersects(Range::from_a1("D4:E5").unwrap()));
    }
}

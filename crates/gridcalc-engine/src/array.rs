//! Array formulas: one canonical expression bound to a rectangular output
//! range, evaluated once to a matrix.
//!
//! The expression is stored at the range's top-left cell; the other cells
//! in the range hold `PtgExp` pointers and select their sub-result from the
//! cached matrix by position.

use gridcalc_model::{CellRef, CellValue, Range};

use gridcalc_biff::Ptg;

/// Evaluated matrix result of an array formula.
pub type Matrix = Vec<Vec<CellValue>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayFormula {
    pub range: Range,
    pub tokens: Vec<Ptg>,
    cached: Option<Matrix>,
}

impl ArrayFormula {
    pub fn new(tokens: Vec<Ptg>, range: Range) -> Self {
        Self {
            range,
            tokens,
            cached: None,
        }
    }

    pub fn is_evaluated(&self) -> bool {
        self.cached.is_some()
    }

    /// Install the evaluated matrix, broadcasting it to the binding range:
    /// a scalar fills the range, a single row/column repeats across the
    /// other axis, and missing cells degrade to `#N/A` as Excel does.
    pub fn set_result(&mut self, result: Matrix) {
        let rows = self.range.rows() as usize;
        let cols = self.range.cols() as usize;
        let src_rows = result.len();
        let src_cols = result.first().map_or(0, Vec::len);

        let mut matrix = Vec::with_capacity(rows);
        for r in 0..rows {
            let mut row = Vec::with_capacity(cols);
            for c in 0..cols {
                let sr = if src_rows == 1 { 0 } else { r };
                let sc = if src_cols == 1 { 0 } else { c };
                let v = result
                    .get(sr)
                    .and_then(|row| row.get(sc))
                    .cloned()
                    .unwrap_or(CellValue::Error(gridcalc_model::ErrorValue::NA));
                row.push(v);
            }
            matrix.push(row);
        }
        self.cached = Some(matrix);
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Sub-result for an in-range cell.
    ///
    /// Panics when `cell` lies outside the binding range or the formula has
    /// not been evaluated: the binding range must be consistent with
    /// membership, so either is a programming error, not a recoverable
    /// condition.
    pub fn value_at(&self, cell: CellRef) -> &CellValue {
        assert!(
            self.range.contains(cell),
            "cell {cell} outside array formula range {}",
            self.range
        );
        let matrix = self
            .cached
            .as_ref()
            .expect("array formula queried before evaluation");
        let r = (cell.row - self.range.start.row) as usize;
        let c = (cell.col - self.range.start.col) as usize;
        &matrix[r][c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matrix(rows: &[&[f64]]) -> Matrix {
        rows.iter()
            .map(|r| r.iter().map(|n| CellValue::Number(*n)).collect())
            .collect()
    }

    #[test]
    fn value_at_indexes_relative_to_the_binding_range() {
        // Bound to rows 2..=4, cols 1..=2 with matrix [[1,2],[3,4],[5,6]].
        let mut array = ArrayFormula::new(
            Vec::new(),
            Range::new(CellRef::new(2, 1), CellRef::new(4, 2)),
        );
        array.set_result(matrix(&[&[1.0, 2.0], &[3.0, 4.0], &[5.0, 6.0]]));
        assert_eq!(array.value_at(CellRef::new(3, 2)), &CellValue::Number(4.0));
        assert_eq!(array.value_at(CellRef::new(2, 1)), &CellValue::Number(1.0));
        assert_eq!(array.value_at(CellRef::new(4, 2)), &CellValue::Number(6.0));
    }

    #[test]
    fn scalar_results_broadcast_across_the_range() {
        let mut array = ArrayFormula::new(
            Vec::new(),
            Range::new(CellRef::new(0, 0), CellRef::new(1, 1)),
        );
        array.set_result(matrix(&[&[7.0]]));
        assert_eq!(array.value_at(CellRef::new(1, 1)), &CellValue::Number(7.0));
    }

    #[test]
    fn single_row_broadcasts_down() {
        let mut array = ArrayFormula::new(
            Vec::new(),
            Range::new(CellRef::new(0, 0), CellRef::new(2, 1)),
        );
        array.set_result(matrix(&[&[1.0, 2.0]]));
        assert_eq!(array.value_at(CellRef::new(2, 0)), &CellValue::Number(1.0));
        assert_eq!(array.value_at(CellRef::new(2, 1)), &CellValue::Number(2.0));
    }

    #[test]
    #[should_panic(expected = "outside array formula range")]
    fn out_of_range_lookup_is_a_programming_error() {
        let mut array = ArrayFormula::new(
            Vec::new(),
            Range::new(CellRef::new(0, 0), CellRef::new(1, 0)),
        );
        array.set_result(matrix(&[&[1.0], &[2.0]]));
        let _ = array.value_at(CellRef::new(5, 5));
    }
}

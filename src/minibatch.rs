//! Stateless staging of training matrices into backend-ready flat buffers.

use ndarray::{ArrayView1, ArrayView2};

use crate::backend::NnData;

/// Flattens the leading `rows x cols` slice of `mat` into a contiguous
/// row-major buffer.
///
/// # Panics
/// If `mat` has fewer than `rows` rows or a column count other than `cols`.
/// These are programming errors, not recoverable failures.
pub fn stage(mat: ArrayView2<NnData>, rows: usize, cols: usize) -> Vec<NnData> {
    assert!(mat.nrows() >= rows);
    assert_eq!(mat.ncols(), cols);

    let mut out = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        out.extend(mat.row(i).iter());
    }

    out
}

/// Same as [`stage`], folding the affine normalization
/// `(value + offset[col]) * scale[col]` into the single pass.
///
/// # Panics
/// As [`stage`], plus if `offset` or `scale` doesn't have length `cols`.
pub fn stage_normalized(
    mat: ArrayView2<NnData>,
    rows: usize,
    cols: usize,
    offset: ArrayView1<NnData>,
    scale: ArrayView1<NnData>,
) -> Vec<NnData> {
    assert_eq!(offset.len(), cols);
    assert_eq!(scale.len(), cols);

    let mut out = stage(mat, rows, cols);
    for i in 0..rows {
        for j in 0..cols {
            let val = &mut out[i * cols + j];
            *val += offset[j];
            *val *= scale[j];
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, array};

    use super::*;

    #[test]
    fn stage_row_major() {
        let mat = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let staged = stage(mat.view(), 2, 2);
        assert_eq!(staged, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn stage_zero_rows() {
        let mat = Array2::<NnData>::zeros((0, 3));
        assert!(stage(mat.view(), 0, 3).is_empty());
    }

    #[test]
    fn stage_normalized_folds_affine() {
        let mat = array![[1.0, 10.0], [3.0, 20.0]];
        let offset = array![-1.0, -10.0];
        let scale = array![2.0, 0.5];

        let staged = stage_normalized(mat.view(), 2, 2, offset.view(), scale.view());
        assert_eq!(staged, vec![0.0, 0.0, 4.0, 5.0]);
    }

    #[test]
    fn stage_normalized_matches_two_pass() {
        let mat = array![[0.5, -2.0, 7.0], [1.5, 4.0, -1.0]];
        let offset = Array1::from_vec(vec![0.25, 1.0, -3.0]);
        let scale = Array1::from_vec(vec![4.0, 0.1, 1.0]);

        let one_pass = stage_normalized(mat.view(), 2, 3, offset.view(), scale.view());

        let mut two_pass = stage(mat.view(), 2, 3);
        for i in 0..2 {
            for j in 0..3 {
                two_pass[i * 3 + j] = (two_pass[i * 3 + j] + offset[j]) * scale[j];
            }
        }

        assert_eq!(one_pass, two_pass);
    }

    #[test]
    #[should_panic]
    fn stage_rejects_short_matrix() {
        let mat = Array2::<NnData>::zeros((1, 2));
        stage(mat.view(), 2, 2);
    }

    #[test]
    #[should_panic]
    fn stage_normalized_rejects_bad_scale_len() {
        let mat = Array2::<NnData>::zeros((1, 2));
        let offset = Array1::zeros(2);
        let scale = Array1::zeros(3);
        stage_normalized(mat.view(), 1, 2, offset.view(), scale.view());
    }
}

//! Least squares for parameters that enter a module linearly.
//!
//! Several gain functions are linear in their coefficients once the input
//! signal and pupil trace are fixed:
//!
//! ```text
//! y = Σ_j θ_j · g_j(x, p)
//! ```
//!
//! so a single regression gives a good starting point for the fitter.
//! The regressor matrix can be nearly collinear (e.g. a flat pupil trace), so
//! we solve via SVD and relax the singular-value cutoff if the strict solve
//! fails.

use nalgebra::{DMatrix, DVector};

/// Solve `min ‖Xθ − y‖²` using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    if x.nrows() == 0 || x.nrows() != y.len() {
        return None;
    }
    let svd = x.clone().svd(true, true);

    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(theta) = svd.solve(y, tol) {
            if theta.iter().all(|v| v.is_finite()) {
                return Some(theta);
            }
        }
    }

    None
}

/// Build the regressor matrix from per-sample rows and solve.
pub fn regress(rows: &[Vec<f64>], y: &[f64]) -> Option<Vec<f64>> {
    let cols = rows.first()?.len();
    if cols == 0 || rows.iter().any(|r| r.len() != cols) {
        return None;
    }
    let x = DMatrix::from_fn(rows.len(), cols, |i, j| rows[i][j]);
    let y = DVector::from_column_slice(y);
    solve_least_squares(&x, &y).map(|theta| theta.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regress_recovers_linear_gain() {
        // y = 0.5 + 2x + 3p
        let samples = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (2.0, 1.0), (1.0, 3.0)];
        let rows: Vec<Vec<f64>> = samples.iter().map(|&(x, p)| vec![1.0, x, p]).collect();
        let y: Vec<f64> = samples.iter().map(|&(x, p)| 0.5 + 2.0 * x + 3.0 * p).collect();

        let theta = regress(&rows, &y).unwrap();
        assert!((theta[0] - 0.5).abs() < 1e-9);
        assert!((theta[1] - 2.0).abs() < 1e-9);
        assert!((theta[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn regress_rejects_empty_input() {
        assert!(regress(&[], &[]).is_none());
    }
}

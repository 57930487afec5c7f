//! Small descriptive statistics used by the metric modules.

/// Keep only the positions where both series are finite.
pub fn finite_pairs(x: &[f64], y: &[f64]) -> (Vec<f64>, Vec<f64>) {
    x.iter()
        .zip(y.iter())
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|(&a, &b)| (a, b))
        .unzip()
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation (divides by `n`).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Pearson correlation, or `None` when either series has no variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x)?;
    let my = mean(y)?;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let denom = (sxx * syy).sqrt();
    if !(denom.is_finite() && denom > 0.0) {
        return None;
    }
    Some((sxy / denom).clamp(-1.0, 1.0))
}

/// Shrink `m` toward zero according to its signal-to-noise ratio `|m| / (s * ratio)`.
///
/// Values whose SNR is at or below 1 are shrunk all the way to zero.
pub fn shrinkage(m: f64, s: f64, ratio: f64) -> f64 {
    let s = if s == 0.0 { f64::EPSILON } else { s };
    let snr = m.abs() / s / ratio;
    let factor = (1.0 - snr.powi(-2)).max(0.0);
    m * factor
}

/// Value at `floor(len * q)` of the ascending-sorted finite values.
pub fn quantile_floor(values: &[f64], q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_pairs_drops_union_of_bad_positions() {
        let x = [1.0, f64::NAN, 3.0, 4.0];
        let y = [1.0, 2.0, f64::INFINITY, 5.0];
        let (a, b) = finite_pairs(&x, &y);
        assert_eq!(a, vec![1.0, 4.0]);
        assert_eq!(b, vec![1.0, 5.0]);
    }

    #[test]
    fn pearson_of_linear_series_is_one() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [3.0, 5.0, 7.0, 9.0];
        assert!((pearson(&x, &y).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson(&x, &[9.0, 7.0, 5.0, 3.0]).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn pearson_of_constant_series_is_undefined() {
        assert!(pearson(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]).is_none());
    }

    #[test]
    fn shrinkage_kills_noisy_estimates() {
        // SNR of 1 -> fully shrunk.
        assert_eq!(shrinkage(0.2, 0.2, 1.0), 0.0);
        // SNR of 2 -> factor 1 - 1/4.
        assert!((shrinkage(0.4, 0.2, 1.0) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn quantile_floor_picks_by_index() {
        let v: Vec<f64> = (0..100).map(|i| i as f64).collect();
        assert_eq!(quantile_floor(&v, 0.5), Some(50.0));
        assert_eq!(quantile_floor(&[3.0, f64::NAN, 1.0, 2.0], 0.99), Some(3.0));
        assert_eq!(quantile_floor(&[], 0.95), None);
    }
}

//! Small descriptive statistics shared by the metric and null-model code.
//!
//! All helpers skip undefined entries (`None`).

/// Mean of defined values; `None` when there are none.
pub fn mean(values: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if defined.is_empty() {
        return None;
    }
    Some(defined.iter().sum::<f64>() / defined.len() as f64)
}

/// Sample standard deviation (n - 1) of defined values; `None` below 2 values.
pub fn sample_sd(values: &[Option<f64>]) -> Option<f64> {
    let defined: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    let n = defined.len();
    if n < 2 {
        return None;
    }
    let m = defined.iter().sum::<f64>() / n as f64;
    let var = defined.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (n - 1) as f64;
    Some(var.sqrt())
}

/// OLS slope of `y` on `x`, using only pairs where `y` is defined.
///
/// `None` with fewer than 2 usable pairs or no spread in `x`.
pub fn ols_slope(x: &[f64], y: &[Option<f64>]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter_map(|(&xi, yi)| yi.map(|v| (xi, v)))
        .collect();
    let n = pairs.len();
    if n < 2 {
        return None;
    }

    let mx = pairs.iter().map(|p| p.0).sum::<f64>() / n as f64;
    let my = pairs.iter().map(|p| p.1).sum::<f64>() / n as f64;
    let sxx: f64 = pairs.iter().map(|p| (p.0 - mx).powi(2)).sum();
    let sxy: f64 = pairs.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum();

    if sxx <= 0.0 {
        return None;
    }
    Some(sxy / sxx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mean_and_sd_skip_undefined() {
        let values = [Some(1.0), None, Some(3.0)];
        assert_relative_eq!(mean(&values).unwrap(), 2.0);
        assert_relative_eq!(sample_sd(&values).unwrap(), 2f64.sqrt(), epsilon = 1e-12);
        assert_eq!(mean(&[None, None]), None);
        assert_eq!(sample_sd(&[Some(1.0)]), None);
    }

    #[test]
    fn test_ols_slope_recovers_line() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [Some(1.0), Some(3.0), None, Some(7.0)];
        assert_relative_eq!(ols_slope(&x, &y).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ols_slope_needs_spread() {
        assert_eq!(ols_slope(&[5.0, 5.0], &[Some(1.0), Some(2.0)]), None);
        assert_eq!(ols_slope(&[1.0, 2.0], &[Some(1.0), None]), None);
    }
}

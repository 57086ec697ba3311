//! Autoregressive and seasonal candidates.
//!
//! The ARMA-family fits use a two-stage estimate: innovations are first
//! approximated by the residuals of a single-lag autoregression, then the
//! moving-average term is recovered by regressing each value on its lag and
//! the lagged innovation. The integrated variant runs the same fit on the
//! first difference and accumulates the forecast back onto the last level.

use super::regression::solve3;

struct ArFit {
    intercept: f64,
    phi: f64,
    residuals: Vec<f64>,
}

/// OLS fit of x_t on x_{t-1} with intercept.
fn fit_ar1(series: &[f64]) -> Option<ArFit> {
    let n = series.len();
    if n < 3 {
        return None;
    }
    let pairs = n - 1;
    let x_mean = series[..pairs].iter().sum::<f64>() / pairs as f64;
    let y_mean = series[1..].iter().sum::<f64>() / pairs as f64;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for t in 1..n {
        let dx = series[t - 1] - x_mean;
        sxy += dx * (series[t] - y_mean);
        sxx += dx * dx;
    }
    if sxx == 0.0 {
        return None;
    }
    let phi = sxy / sxx;
    let intercept = y_mean - phi * x_mean;

    let residuals = (1..n)
        .map(|t| series[t] - (intercept + phi * series[t - 1]))
        .collect();
    Some(ArFit {
        intercept,
        phi,
        residuals,
    })
}

/// Single-lag autoregressive forecast; also the driver's fallback model.
pub fn ar1(history: &[f64], horizon: usize) -> Option<Vec<f64>> {
    let fit = fit_ar1(history)?;
    let mut forecast = Vec::with_capacity(horizon);
    let mut last = *history.last()?;
    for _ in 0..horizon {
        last = fit.intercept + fit.phi * last;
        if !last.is_finite() {
            return None;
        }
        forecast.push(last);
    }
    Some(forecast)
}

struct ArmaFit {
    intercept: f64,
    phi: f64,
    theta: f64,
    last_innovation: f64,
}

fn fit_arma11(series: &[f64]) -> Option<ArmaFit> {
    let n = series.len();
    if n < 4 {
        return None;
    }
    let ar = fit_ar1(series)?;
    // ar.residuals[k] is the innovation at index k+1.

    // Regress x_t on [1, x_{t-1}, e_{t-1}] for t = 2..n.
    let mut a = [[0.0f64; 3]; 3];
    let mut b = [0.0f64; 3];
    for t in 2..n {
        let basis = [1.0, series[t - 1], ar.residuals[t - 2]];
        for r in 0..3 {
            for c in 0..3 {
                a[r][c] += basis[r] * basis[c];
            }
            b[r] += basis[r] * series[t];
        }
    }
    let coeffs = solve3(a, b)?;

    Some(ArmaFit {
        intercept: coeffs[0],
        phi: coeffs[1],
        theta: coeffs[2],
        last_innovation: *ar.residuals.last()?,
    })
}

/// ARMA(1,1) forecast: future innovations are taken as zero, so the
/// moving-average term only affects the first step.
pub fn arma11(history: &[f64], horizon: usize) -> Option<Vec<f64>> {
    let fit = fit_arma11(history)?;
    let mut forecast = Vec::with_capacity(horizon);
    let mut last = *history.last()?;
    let mut innovation = fit.last_innovation;
    for _ in 0..horizon {
        last = fit.intercept + fit.phi * last + fit.theta * innovation;
        innovation = 0.0;
        if !last.is_finite() {
            return None;
        }
        forecast.push(last);
    }
    Some(forecast)
}

/// ARIMA(1,1,1): ARMA(1,1) on the first difference, integrated back onto
/// the last observed level.
pub fn arima111(history: &[f64], horizon: usize) -> Option<Vec<f64>> {
    let n = history.len();
    if n < 5 {
        return None;
    }
    let diffs: Vec<f64> = history.windows(2).map(|w| w[1] - w[0]).collect();
    let diff_forecast = arma11(&diffs, horizon)?;

    let mut level = *history.last()?;
    let mut forecast = Vec::with_capacity(horizon);
    for d in diff_forecast {
        level += d;
        if !level.is_finite() {
            return None;
        }
        forecast.push(level);
    }
    Some(forecast)
}

/// Repeat the last full seasonal cycle.
pub fn seasonal_naive(history: &[f64], horizon: usize, period: usize) -> Option<Vec<f64>> {
    let n = history.len();
    if period < 2 || n < period {
        return None;
    }
    let cycle = &history[n - period..];
    Some((0..horizon).map(|i| cycle[i % period]).collect())
}

/// Additive Holt-Winters with fixed smoothing parameters; needs two full
/// seasonal cycles to initialize level, trend and the seasonal profile.
pub fn holt_winters(history: &[f64], horizon: usize, period: usize) -> Option<Vec<f64>> {
    const ALPHA: f64 = 0.2;
    const BETA: f64 = 0.1;
    const GAMMA: f64 = 0.1;

    let n = history.len();
    if period < 2 || n < 2 * period {
        return None;
    }

    let first_cycle_mean = history[..period].iter().sum::<f64>() / period as f64;
    let second_cycle_mean = history[period..2 * period].iter().sum::<f64>() / period as f64;

    let mut level = first_cycle_mean;
    let mut trend = (second_cycle_mean - first_cycle_mean) / period as f64;
    let mut seasonal: Vec<f64> = history[..period]
        .iter()
        .map(|v| v - first_cycle_mean)
        .collect();

    for (t, value) in history.iter().enumerate() {
        let season = seasonal[t % period];
        let prev_level = level;
        level = ALPHA * (value - season) + (1.0 - ALPHA) * (level + trend);
        trend = BETA * (level - prev_level) + (1.0 - BETA) * trend;
        seasonal[t % period] = GAMMA * (value - level) + (1.0 - GAMMA) * season;
    }

    let forecast: Vec<f64> = (1..=horizon)
        .map(|h| level + trend * h as f64 + seasonal[(n + h - 1) % period])
        .collect();
    if forecast.iter().all(|v| v.is_finite()) {
        Some(forecast)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ar1_exact_on_linear_walk() {
        // x_t = x_{t-1} + 10 is an exact AR(1) with phi = 1, c = 10.
        let history: Vec<f64> = (1..=8).map(|i| (i * 10) as f64).collect();
        let fc = ar1(&history, 3).unwrap();
        assert!((fc[0] - 90.0).abs() < 1e-6);
        assert!((fc[2] - 110.0).abs() < 1e-6);
    }

    #[test]
    fn test_ar1_needs_three_points() {
        assert!(ar1(&[1.0, 2.0], 3).is_none());
        assert!(ar1(&[5.0, 5.0, 5.0], 3).is_none()); // zero lag variance
    }

    #[test]
    fn test_arima_produces_finite_horizon() {
        let history = [5.0, 8.0, 7.0, 12.0, 11.0, 16.0, 14.0, 20.0, 19.0, 24.0];
        let fc = arima111(&history, 4).unwrap();
        assert_eq!(fc.len(), 4);
        assert!(fc.iter().all(|v| v.is_finite()));
        assert!(arima111(&history[..4], 4).is_none());
    }

    #[test]
    fn test_seasonal_naive_repeats_last_cycle() {
        let history = [1.0, 2.0, 3.0, 4.0, 10.0, 20.0, 30.0, 40.0];
        let fc = seasonal_naive(&history, 6, 4).unwrap();
        assert_eq!(fc, vec![10.0, 20.0, 30.0, 40.0, 10.0, 20.0]);
        assert!(seasonal_naive(&history, 6, 12).is_none());
    }

    #[test]
    fn test_holt_winters_tracks_seasonal_level() {
        // Two years of a strong quarterly cycle around a flat level.
        let cycle = [100.0, 50.0, 150.0, 100.0];
        let history: Vec<f64> = cycle.iter().cycle().take(12).cloned().collect();
        let fc = holt_winters(&history, 4, 4).unwrap();
        assert_eq!(fc.len(), 4);
        // The trough and peak keep their ordering.
        assert!(fc[1] < fc[2]);
        assert!(holt_winters(&history[..6], 4, 4).is_none());
    }
}

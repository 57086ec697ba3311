//! Time-series forecasting driver.
//!
//! Given a finite numeric history, pick the best of a set of candidate
//! models and return a fixed-length forecast. Degenerate histories take
//! fast paths (constant series, exact repeating patterns) before any model
//! is fitted; everything else is scored on the overlap of the history tail
//! with the forecast head and the lowest-scoring usable candidate wins.
//!
//! All candidates are closed-form fits, so the driver is deterministic for
//! a given `(history, horizon, seasonality)` input.

mod arima;
mod regression;

use tracing::debug;

/// Weight split between RMSE and MAE in the combined model score.
const RMSE_WEIGHT: f64 = 0.25;
const MAE_WEIGHT: f64 = 0.75;

/// Produce a `horizon`-length forecast for the history.
///
/// * Histories shorter than 2 produce an empty forecast (the caller emits no
///   forecast records).
/// * Every returned value is a non-negative integer-valued float.
/// * `seasonality` of 0 disables the seasonal candidates.
pub fn forecast(history: &[f64], horizon: usize, seasonality: usize) -> Vec<f64> {
    if horizon == 0 || history.len() < 2 {
        return Vec::new();
    }

    // Constant series repeat themselves.
    if history.iter().all(|v| *v == history[0]) {
        debug!("Using pattern repetition as model");
        return clamp(vec![history[0]; horizon]);
    }

    // Exactly tiled histories continue the tiling.
    if let Some(pattern) = repeating_prefix(history) {
        debug!("Using pattern repetition as model");
        let tiled = (0..horizon).map(|i| pattern[i % pattern.len()]).collect();
        return clamp(tiled);
    }

    let mut candidates: Vec<(&'static str, Vec<f64>)> = Vec::new();
    let push = |candidates: &mut Vec<(&'static str, Vec<f64>)>,
                name: &'static str,
                fit: Option<Vec<f64>>| {
        if let Some(fc) = fit {
            candidates.push((name, fc));
        }
    };

    push(&mut candidates, "linear", regression::linear(history, horizon));
    push(&mut candidates, "ridge", regression::ridge(history, horizon));
    push(&mut candidates, "lasso", regression::lasso(history, horizon));
    push(
        &mut candidates,
        "elastic-net",
        regression::elastic_net(history, horizon),
    );
    push(
        &mut candidates,
        "polynomial",
        regression::polynomial(history, horizon),
    );
    push(&mut candidates, "ar1", arima::ar1(history, horizon));
    push(&mut candidates, "arma", arima::arma11(history, horizon));
    push(&mut candidates, "arima", arima::arima111(history, horizon));
    if seasonality >= 2 {
        push(
            &mut candidates,
            "seasonal-naive",
            arima::seasonal_naive(history, horizon, seasonality),
        );
        push(
            &mut candidates,
            "holt-winters",
            arima::holt_winters(history, horizon, seasonality),
        );
    }

    let mut scored: Vec<(&'static str, Vec<f64>, f64)> = candidates
        .into_iter()
        .filter_map(|(name, fc)| combined_score(history, &fc).map(|s| (name, fc, s)))
        .collect();
    scored.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    for (name, _, score) in &scored {
        debug!("Model: {} | combined score: {:.4}", name, score);
    }

    // Lowest score wins, but only if the forecast carries signal: not flat,
    // strictly positive.
    for (name, fc, _) in &scored {
        let non_constant = fc.iter().any(|v| *v != fc[0]);
        let strictly_positive = fc.iter().all(|v| *v > 0.0);
        if non_constant && strictly_positive {
            debug!("Using {} as the model with the lowest valid combined score", name);
            return clamp(fc.clone());
        }
    }

    // Every candidate degenerated; a single-lag autoregression is the last
    // resort before giving up entirely.
    debug!("All models failed; defaulting to single-lag autoregression");
    match arima::ar1(history, horizon) {
        Some(fc) if fc.iter().all(|v| v.is_finite()) => clamp(fc),
        _ => Vec::new(),
    }
}

/// Smallest prefix whose tiling reproduces the whole series.
fn repeating_prefix(series: &[f64]) -> Option<&[f64]> {
    let n = series.len();
    for p in 1..=n / 2 {
        if n % p != 0 {
            continue;
        }
        if series.iter().enumerate().all(|(i, v)| *v == series[i % p]) {
            return Some(&series[..p]);
        }
    }
    None
}

/// In-sample score over the overlap of the history tail with the forecast
/// head; None when the forecast contains non-finite values.
fn combined_score(history: &[f64], forecast: &[f64]) -> Option<f64> {
    let k = history.len().min(forecast.len());
    if k == 0 {
        return None;
    }
    let actual = &history[history.len() - k..];
    let predicted = &forecast[..k];
    if predicted.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut sq_sum = 0.0;
    let mut abs_sum = 0.0;
    for (a, p) in actual.iter().zip(predicted) {
        let err = a - p;
        sq_sum += err * err;
        abs_sum += err.abs();
    }
    let rmse = (sq_sum / k as f64).sqrt();
    let mae = abs_sum / k as f64;
    Some((RMSE_WEIGHT * rmse + MAE_WEIGHT * mae) / (RMSE_WEIGHT + MAE_WEIGHT))
}

/// Round to integers and clamp negatives to zero.
fn clamp(forecast: Vec<f64>) -> Vec<f64> {
    forecast
        .into_iter()
        .map(|v| if v.is_finite() { v.round().max(0.0) } else { 0.0 })
        .collect()
}

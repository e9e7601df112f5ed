//! Utilization forecasting
//!
//! Forecasts near-term utilization for a resource kind from its sampled
//! series. Models degrade to "no forecast" on insufficient or degenerate
//! data instead of erroring; detection on observed values always proceeds.

use crate::history::WindowStats;

/// Minimum points before any model will forecast
pub(crate) const MIN_POINTS_FOR_FORECAST: usize = 3;

/// Recent points the moving-average model considers
const MOVING_AVERAGE_WINDOW: usize = 5;

/// A single utilization forecast
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    /// Predicted utilization percentage at the horizon, clamped to [0, 100]
    pub value_pct: f64,
    /// Goodness of fit in [0, 1]
    pub confidence: f64,
}

/// Forecasting model over one utilization series
///
/// `points` are `(timestamp_secs, pct)` tuples sorted oldest first with gap
/// markers already removed.
pub trait PredictionModel: Send + Sync {
    fn name(&self) -> &'static str;

    fn forecast(&self, points: &[(i64, f64)], horizon_secs: u64) -> Option<Forecast>;
}

/// Look up a built-in model by its configured name
pub fn model_for(name: &str) -> Option<Box<dyn PredictionModel>> {
    match name {
        "linear" => Some(Box::new(LinearTrendModel)),
        "moving-average" => Some(Box::new(MovingAverageModel)),
        _ => None,
    }
}

/// Least-squares trend extrapolated to the horizon
///
/// Confidence is the coefficient of determination of the fit.
pub struct LinearTrendModel;

impl PredictionModel for LinearTrendModel {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forecast(&self, points: &[(i64, f64)], horizon_secs: u64) -> Option<Forecast> {
        if points.len() < MIN_POINTS_FOR_FORECAST {
            return None;
        }
        let fit = least_squares(points)?;
        let t0 = points.first()?.0;
        let last = points.last()?.0;
        let x = (last - t0) as f64 + horizon_secs as f64;

        Some(Forecast {
            value_pct: (fit.slope * x + fit.intercept).clamp(0.0, 100.0),
            confidence: fit.r_squared.clamp(0.0, 1.0),
        })
    }
}

/// Mean of the recent window as a persistence forecast
///
/// Confidence falls with dispersion relative to the mean.
pub struct MovingAverageModel;

impl PredictionModel for MovingAverageModel {
    fn name(&self) -> &'static str {
        "moving-average"
    }

    fn forecast(&self, points: &[(i64, f64)], _horizon_secs: u64) -> Option<Forecast> {
        if points.len() < MIN_POINTS_FOR_FORECAST {
            return None;
        }
        let tail = &points[points.len().saturating_sub(MOVING_AVERAGE_WINDOW)..];
        let stats = WindowStats::from_values(tail.iter().map(|(_, v)| *v));

        Some(Forecast {
            value_pct: stats.mean.clamp(0.0, 100.0),
            confidence: (1.0 - stats.std_dev / stats.mean.max(1.0)).clamp(0.0, 1.0),
        })
    }
}

struct LinearFit {
    slope: f64,
    intercept: f64,
    r_squared: f64,
}

/// Least-squares fit with timestamps normalized to the first point
fn least_squares(points: &[(i64, f64)]) -> Option<LinearFit> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let t0 = points.first()?.0 as f64;

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for (ts, value) in points {
        let x = *ts as f64 - t0;
        sum_x += x;
        sum_y += value;
        sum_xy += x * value;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return None;
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let mean_y = sum_y / n;
    let mean_x = sum_x / n;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (ts, value) in points {
        let x = *ts as f64 - t0;
        let predicted = slope * x + intercept;
        ss_res += (value - predicted).powi(2);
        ss_tot += (value - mean_y).powi(2);
    }
    // A flat series fit perfectly is still a confident forecast
    let r_squared = if ss_tot.abs() < f64::EPSILON {
        if ss_res.abs() < f64::EPSILON {
            1.0
        } else {
            0.0
        }
    } else {
        1.0 - ss_res / ss_tot
    };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

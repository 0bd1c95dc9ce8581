//! Short-horizon utilization forecasting.
//!
//! Fits an ordinary least-squares line through `(minutes, utilization)`
//! samples and extrapolates it. Confidence is the fit's r² scaled down
//! while there are few samples.

use serde::Serialize;

use runnergrid_state::{MetricSnapshot, ScalingPolicy};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Prediction {
    pub repository: String,
    pub horizon_minutes: f64,
    pub samples: usize,
    pub current_utilization: f64,
    /// Clamped to 0.0..=1.0.
    pub predicted_utilization: f64,
    /// Utilization change per minute.
    pub trend_per_minute: f64,
    pub recommended_runners: u32,
    /// 0.0..=1.0
    pub confidence: f64,
}

impl Prediction {
    /// The answer when there is too little history to say anything.
    pub fn insufficient(repository: &str, horizon_minutes: f64, samples: usize) -> Self {
        Self {
            repository: repository.to_string(),
            horizon_minutes,
            samples,
            current_utilization: 0.0,
            predicted_utilization: 0.0,
            trend_per_minute: 0.0,
            recommended_runners: 0,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

pub(crate) fn fit(points: &[(f64, f64)]) -> Option<LinearFit> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for &(x, y) in points {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
        syy += (y - mean_y) * (y - mean_y);
    }

    // All samples at one instant: no trend to speak of.
    if sxx == 0.0 {
        return Some(LinearFit {
            slope: 0.0,
            intercept: mean_y,
            r_squared: if syy == 0.0 { 1.0 } else { 0.0 },
        });
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if syy == 0.0 {
        1.0
    } else {
        (sxy * sxy / (sxx * syy)).clamp(0.0, 1.0)
    };
    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

/// Forecast utilization `horizon_minutes` past the newest sample.
pub(crate) fn predict(
    repository: &str,
    samples: &[MetricSnapshot],
    horizon_minutes: f64,
    policy: &ScalingPolicy,
    min_samples: usize,
    full_confidence_samples: usize,
) -> Prediction {
    let horizon_minutes = horizon_minutes.max(0.0);
    // Imported or clock-skewed history can arrive out of order.
    let mut samples: Vec<&MetricSnapshot> = samples.iter().collect();
    samples.sort_by_key(|s| s.timestamp_ms);
    let (Some(&first), Some(&last)) = (samples.first(), samples.last()) else {
        return Prediction::insufficient(repository, horizon_minutes, 0);
    };
    if samples.len() < min_samples.max(2) {
        return Prediction::insufficient(repository, horizon_minutes, samples.len());
    }

    let origin = first.timestamp_ms;
    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (s.timestamp_ms.saturating_sub(origin) as f64 / 60_000.0, s.utilization))
        .collect();
    let Some(line) = fit(&points) else {
        return Prediction::insufficient(repository, horizon_minutes, samples.len());
    };

    let last_x = last.timestamp_ms.saturating_sub(origin) as f64 / 60_000.0;
    let projected = line.at(last_x + horizon_minutes).max(0.0);

    let target = policy.scale_up_threshold.max(f64::EPSILON);
    let needed = (f64::from(last.runner_count) * projected / target).ceil();
    let recommended = (needed.min(f64::from(u32::MAX)) as u32).clamp(policy.min_runners, policy.max_runners);

    let sample_weight = (samples.len() as f64 / full_confidence_samples.max(1) as f64).min(1.0);

    Prediction {
        repository: repository.to_string(),
        horizon_minutes,
        samples: samples.len(),
        current_utilization: last.utilization,
        predicted_utilization: projected.min(1.0),
        trend_per_minute: line.slope,
        recommended_runners: recommended,
        confidence: line.r_squared * sample_weight,
    }
}

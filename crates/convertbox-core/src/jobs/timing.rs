//! Elapsed/remaining time derivation for running jobs.

use std::time::Duration;

/// Below this much progress the remaining-time estimate is too noisy to show.
pub const MIN_PROGRESS_FOR_ESTIMATE: f64 = 0.01;

/// Estimate the time left given elapsed time and fractional progress.
///
/// Uses `elapsed * (1 - p) / p`. Returns `None` until progress reaches
/// [`MIN_PROGRESS_FOR_ESTIMATE`].
pub fn estimate_remaining(elapsed: Duration, progress: f64) -> Option<Duration> {
    let p = if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) };
    if p < MIN_PROGRESS_FOR_ESTIMATE {
        return None;
    }
    let secs = elapsed.as_secs_f64() * (1.0 - p) / p;
    Some(Duration::from_secs_f64(secs.max(0.0)))
}

/// Render a duration the way the progress display shows it.
///
/// `45s`, `3m 07s`, `1h 02m`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m", h, m)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

//! Display helpers for aggregate state
//!
//! Keeps rounding and labels out of the engine so every screen renders a
//! snapshot the same way.

use types::snapshot::{AggregateState, Mean};

pub const LOADING_LABEL: &str = "Loading…";
pub const SIGNED_OUT_LABEL: &str = "Sign in to see live busyness";
pub const ERROR_LABEL: &str = "Error loading data";
pub const NO_DATA_LABEL: &str = "No data";

/// Round to one decimal place, halves away from zero.
pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// "4.3" for a mean, "No data" when there is none.
pub fn format_mean(mean: &Mean) -> String {
    match mean {
        Mean::NoData => NO_DATA_LABEL.to_string(),
        Mean::Value(v) => format!("{:.1}", round_one_decimal(*v)),
    }
}

/// One-line description of a state.
pub fn describe(state: &AggregateState) -> String {
    match state {
        AggregateState::Loading => LOADING_LABEL.to_string(),
        AggregateState::AccessDenied => SIGNED_OUT_LABEL.to_string(),
        AggregateState::Error { .. } => ERROR_LABEL.to_string(),
        AggregateState::Ready(snapshot) => format!(
            "Now {} ({} in the last hour) | All time {} ({} ratings)",
            format_mean(&snapshot.windowed_mean_score),
            snapshot.windowed_sample_count,
            format_mean(&snapshot.mean_score),
            snapshot.sample_count,
        ),
    }
}

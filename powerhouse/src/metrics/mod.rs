//! Metric records and the measurement pipeline

use chrono::{DateTime, Utc};
use serde::Serialize;

mod backlight;
mod battery;
pub mod report;

pub use backlight::BacklightMetrics;
pub use battery::BatteryMetrics;
pub use report::ReportConfig;

/// One record on the metrics stream
///
/// Either a successful sample with battery and backlight readings, or an
/// error marker for a failed tick. Records serialize to JSON one object per
/// line when emitted by the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    /// Wall-clock time of emission
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatteryMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backlight: Option<BacklightMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Metrics {
    pub(crate) fn sample(battery: BatteryMetrics, backlight: BacklightMetrics) -> Self {
        Self {
            time: Utc::now(),
            battery: Some(battery),
            backlight: Some(backlight),
            error: None,
        }
    }

    pub(crate) fn from_error(error: &crate::PowerhouseError) -> Self {
        Self {
            time: Utc::now(),
            battery: None,
            backlight: None,
            error: Some(error.to_string()),
        }
    }
}

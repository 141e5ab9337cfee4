//! Backlight telemetry decoding
//!
//! The `AppleARMBacklight` IORegistry entry nests its interesting values
//! under `IODisplayParameters`; they are carried over verbatim, no scaling.

use serde::{Deserialize, Serialize};

use crate::PowerhouseError;

/// One decoded backlight sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklightMetrics {
    pub raw_brightness_min: u64,
    pub raw_brightness_max: u64,
    pub raw_brightness_value: u64,
    pub brightness_min: u64,
    pub brightness_max: u64,
    pub brightness_value: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBacklight {
    #[serde(rename = "IODisplayParameters")]
    io_display_parameters: RawDisplayParameters,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDisplayParameters {
    #[serde(rename = "rawBrightness")]
    raw_brightness: RawRange,
    brightness: RawRange,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRange {
    min: u64,
    max: u64,
    value: u64,
}

impl BacklightMetrics {
    /// Decodes an `AppleARMBacklight` registry entry
    pub fn from_registry(registry: plist::Dictionary) -> Result<Self, PowerhouseError> {
        let raw: RawBacklight = plist::from_value(&plist::Value::Dictionary(registry))?;
        let params = raw.io_display_parameters;

        Ok(Self {
            raw_brightness_min: params.raw_brightness.min,
            raw_brightness_max: params.raw_brightness.max,
            raw_brightness_value: params.raw_brightness.value,
            brightness_min: params.brightness.min,
            brightness_max: params.brightness.max,
            brightness_value: params.brightness.value,
        })
    }
}

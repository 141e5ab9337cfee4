//! Battery telemetry decoding
//!
//! The `AppleSmartBattery` IORegistry entry reports raw integers in
//! milliampere-hours, millivolts and milliamperes; decoding scales them to
//! base units. Keys absent from the entry decode to zero, a key of the
//! wrong shape fails the whole record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::PowerhouseError;

/// One decoded battery sample
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryMetrics {
    /// Device-side time the registry entry was last updated
    pub time: DateTime<Utc>,
    /// Whether external power is connected
    pub is_connected: bool,
    pub is_charging: bool,
    pub is_fully_charged: bool,
    pub cycle_count: u64,
    /// Design capacity in Ah
    pub design_capacity: f64,
    /// Measured full-charge capacity in Ah
    pub apple_raw_max_capacity: f64,
    /// Nominal full-charge capacity in Ah
    pub nominal_charge_capacity: f64,
    /// Current charge in Ah
    pub apple_raw_current_capacity: f64,
    /// Battery voltage in V
    pub apple_raw_battery_voltage: f64,
    /// Voltage at boot in V
    pub boot_voltage: f64,
    /// Smoothed voltage in V
    pub voltage: f64,
    /// Instantaneous current in A; positive while charging, negative while
    /// discharging
    pub instant_amperage: f64,
    /// Battery temperature in °C
    pub temperature: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawBattery {
    update_time: i64,
    external_connected: bool,
    is_charging: bool,
    fully_charged: bool,
    cycle_count: u64,
    design_capacity: u64,
    apple_raw_max_capacity: u64,
    nominal_charge_capacity: u64,
    apple_raw_current_capacity: u64,
    apple_raw_battery_voltage: u64,
    boot_voltage: u64,
    voltage: u64,
    instant_amperage: i64,
    temperature: i64,
}

impl BatteryMetrics {
    /// Decodes and scales an `AppleSmartBattery` registry entry
    pub fn from_registry(registry: plist::Dictionary) -> Result<Self, PowerhouseError> {
        let raw: RawBattery = plist::from_value(&plist::Value::Dictionary(registry))?;

        Ok(Self {
            time: DateTime::from_timestamp(raw.update_time, 0).unwrap_or(DateTime::UNIX_EPOCH),
            is_connected: raw.external_connected,
            is_charging: raw.is_charging,
            is_fully_charged: raw.fully_charged,
            cycle_count: raw.cycle_count,
            design_capacity: raw.design_capacity as f64 / 1000.0,
            apple_raw_max_capacity: raw.apple_raw_max_capacity as f64 / 1000.0,
            nominal_charge_capacity: raw.nominal_charge_capacity as f64 / 1000.0,
            apple_raw_current_capacity: raw.apple_raw_current_capacity as f64 / 1000.0,
            apple_raw_battery_voltage: raw.apple_raw_battery_voltage as f64 / 1000.0,
            boot_voltage: raw.boot_voltage as f64 / 1000.0,
            voltage: raw.voltage as f64 / 1000.0,
            instant_amperage: raw.instant_amperage as f64 / 1000.0,
            // Empirical offset specific to Apple's gas gauge encoding
            temperature: raw.temperature as f64 / 100.0 + 30.0,
        })
    }
}

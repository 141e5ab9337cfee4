//! Consumer surface
//!
//! [`Powerhouse`] is the top object: it enumerates attached devices and
//! wraps each one into a [`Device`] carrying the lockdown-reported identity
//! fields and the provider used by the measurement pipeline.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::lockdown::LockdownClient;
use crate::metrics::{report, Metrics, ReportConfig};
use crate::provider::UsbmuxProvider;
use crate::usbmux::{Connection, DeviceHandle, UsbmuxAddr};
use crate::{with_deadline, PowerhouseError};

/// Deadline for the initial mux enumeration
const ENUMERATE_DEADLINE: Duration = Duration::from_secs(30);

/// Client label stamped onto all connections
const LABEL: &str = "powerhouse";

/// Entry point for device discovery
#[derive(Debug, Clone)]
pub struct Powerhouse {
    addr: UsbmuxAddr,
}

impl Powerhouse {
    /// Creates a client against the usbmuxd address from the environment
    pub fn new() -> Result<Self, PowerhouseError> {
        Ok(Self {
            addr: UsbmuxAddr::from_env_var()?,
        })
    }

    /// Creates a client against a specific usbmuxd address
    pub fn with_addr(addr: UsbmuxAddr) -> Self {
        Self { addr }
    }

    /// Enumerates attached devices and reads their identity
    ///
    /// Devices whose lockdown info cannot be fetched (locked down hard,
    /// mid-detach) are skipped with a warning rather than failing the whole
    /// enumeration.
    pub async fn devices(&self) -> Result<Vec<Device>, PowerhouseError> {
        let mut mux = self.addr.connect().await?;
        let handles = with_deadline(
            "enumerate devices",
            ENUMERATE_DEADLINE,
            mux.list_devices(),
        )
        .await?;

        let mut devices = Vec::with_capacity(handles.len());
        for handle in handles {
            let provider = handle.to_provider(self.addr.clone(), LABEL);
            match Device::from_handle(handle, provider).await {
                Ok(device) => devices.push(device),
                Err(e) => warn!("Unable to read device info: {e}"),
            }
        }
        Ok(devices)
    }
}

/// One attached device with its lockdown-reported identity
///
/// All fields but the UDID may be empty when the device declines to report
/// them.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub model: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
    #[serde(rename = "OSBuild")]
    pub os_build: String,
    #[serde(rename = "WiFiAddress")]
    pub wifi_address: String,
    #[serde(rename = "ConnectionType", serialize_with = "display")]
    pub connection_type: Connection,
    #[serde(skip)]
    ios_major: u32,
    #[serde(skip)]
    provider: UsbmuxProvider,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DeviceInfo {
    #[serde(rename = "UniqueDeviceID")]
    unique_device_id: String,
    #[serde(rename = "DeviceName")]
    device_name: String,
    #[serde(rename = "ProductType")]
    product_type: String,
    #[serde(rename = "ProductVersion")]
    product_version: String,
    #[serde(rename = "BuildVersion")]
    build_version: String,
    #[serde(rename = "WiFiAddress")]
    wifi_address: String,
}

impl Device {
    /// Reads the identity of an enumerated device over a short-lived
    /// lockdown connection
    async fn from_handle(
        handle: DeviceHandle,
        provider: UsbmuxProvider,
    ) -> Result<Self, PowerhouseError> {
        let mut lockdown = LockdownClient::connect(&provider).await?;
        let info = lockdown.get_value(None, None).await?;
        let info: DeviceInfo = plist::from_value(&info)?;

        // The major is all that TLS version pinning needs; an unparsable
        // version yields 0 and with it the conservative profile.
        let ios_major = info
            .product_version
            .split('.')
            .next()
            .and_then(|x| x.parse().ok())
            .unwrap_or(0);

        let udid = if info.unique_device_id.is_empty() {
            handle.udid
        } else {
            info.unique_device_id
        };

        Ok(Self {
            udid,
            name: info.device_name,
            model: info.product_type,
            os_version: info.product_version,
            os_build: info.build_version,
            wifi_address: info.wifi_address,
            connection_type: handle.connection_type,
            ios_major,
            provider,
        })
    }

    /// Starts reporting metrics until the token is cancelled
    ///
    /// See [`report::start`] for the lifecycle of the returned stream.
    pub async fn report_metrics(
        &self,
        config: ReportConfig,
        token: CancellationToken,
    ) -> Result<mpsc::Receiver<Metrics>, PowerhouseError> {
        report::start(&self.provider, self.ios_major, config, token).await
    }
}

fn display<T: std::fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

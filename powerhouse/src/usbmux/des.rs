//! Serde views of usbmuxd responses

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::warn;
use serde::Deserialize;

use crate::usbmux::{Connection, DeviceHandle};
use crate::PowerhouseError;

#[derive(Deserialize)]
pub(super) struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct DeviceEntry {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct DeviceProperties {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "ProductID")]
    pub product_id: Option<u32>,
}

impl TryFrom<DeviceEntry> for DeviceHandle {
    type Error = PowerhouseError;

    fn try_from(dev: DeviceEntry) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => {
                let Some(addr) = dev.properties.network_address else {
                    warn!("Device is network attached, but has no network info");
                    return Err(PowerhouseError::UnexpectedResponse);
                };
                parse_sockaddr(&Into::<Vec<u8>>::into(addr))?
            }
            _ => Connection::Unknown(dev.properties.connection_type),
        };

        Ok(DeviceHandle {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
            product_id: dev.properties.product_id.unwrap_or_default(),
        })
    }
}

/// Decodes the BSD sockaddr blob usbmuxd reports for network devices
fn parse_sockaddr(addr: &[u8]) -> Result<Connection, PowerhouseError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(PowerhouseError::UnexpectedResponse);
    }

    match addr[1] {
        0x02 => {
            // AF_INET, address at offset 4 of sockaddr_in
            Ok(Connection::Network(IpAddr::V4(Ipv4Addr::new(
                addr[4], addr[5], addr[6], addr[7],
            ))))
        }
        0x1E => {
            // AF_INET6, address at offset 8 of sockaddr_in6
            if addr.len() < 24 {
                warn!("IPv6 sockaddr is less than 24 bytes");
                return Err(PowerhouseError::UnexpectedResponse);
            }
            let mut segments = [0u16; 8];
            for (i, segment) in segments.iter_mut().enumerate() {
                *segment = u16::from_be_bytes([addr[8 + 2 * i], addr[9 + 2 * i]]);
            }
            Ok(Connection::Network(IpAddr::V6(Ipv6Addr::from(segments))))
        }
        family => {
            warn!("Unknown address family: {family:02X}");
            Ok(Connection::Unknown(format!("Network {family:02X}")))
        }
    }
}

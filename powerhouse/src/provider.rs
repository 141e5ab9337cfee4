//! Connection providers
//!
//! A provider knows how to reach one specific device: it opens streams to
//! device ports and supplies the pair record for TLS upgrades. The lockdown
//! client and the measurement pipeline are generic over this seam, which is
//! also where tests plug in scripted in-memory devices.

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::pair_record::PairRecord;
use crate::usbmux::UsbmuxAddr;
use crate::{DeviceConnection, PowerhouseError};

pub trait DeviceProvider: Send + Sync + std::fmt::Debug {
    /// Opens a fresh stream to the given TCP port on the device
    fn connect(
        &self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<DeviceConnection, PowerhouseError>> + Send;

    /// Client label stamped onto every request of connections from this
    /// provider
    fn label(&self) -> &str;

    /// Loads the pair record for the device
    fn pair_record(
        &self,
    ) -> impl std::future::Future<Output = Result<PairRecord, PowerhouseError>> + Send;
}

/// Reaches a device through the local usbmuxd
///
/// Each `connect` opens a fresh mux connection, issues `Connect` and hands
/// the resulting stream over; the pair record comes from the muxer's store.
#[derive(Debug, Clone)]
pub struct UsbmuxProvider {
    addr: UsbmuxAddr,
    udid: String,
    device_id: u32,
    label: String,
}

impl UsbmuxProvider {
    pub fn new(addr: UsbmuxAddr, udid: String, device_id: u32, label: impl Into<String>) -> Self {
        Self {
            addr,
            udid,
            device_id,
            label: label.into(),
        }
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }
}

impl DeviceProvider for UsbmuxProvider {
    async fn connect(&self, port: u16) -> Result<DeviceConnection, PowerhouseError> {
        let mux = self.addr.connect().await?;
        mux.connect(self.device_id, port, &self.label).await
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    async fn pair_record(&self) -> Result<PairRecord, PowerhouseError> {
        let mut mux = self.addr.connect().await?;
        mux.read_pair_record(&self.udid).await
    }
}

/// Reaches a network device directly over TCP
///
/// Used when the muxer is not involved at all; the pair record must have
/// been loaded from disk beforehand.
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pair_record: PairRecord,
    pub label: String,
}

impl DeviceProvider for TcpProvider {
    async fn connect(&self, port: u16) -> Result<DeviceConnection, PowerhouseError> {
        let socket_addr = SocketAddr::new(self.addr, port);
        let stream = TcpStream::connect(socket_addr).await?;
        Ok(DeviceConnection::new(Box::new(stream), self.label.clone()))
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    async fn pair_record(&self) -> Result<PairRecord, PowerhouseError> {
        Ok(self.pair_record.clone())
    }
}

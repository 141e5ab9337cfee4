//! usbmuxd client
//!
//! Talks to the USB multiplexing daemon that tunnels TCP-like connections to
//! devices attached over USB or the local network: device enumeration, pair
//! record lookup and opening per-device streams.
//!
//! One request is in flight per connection at a time. `Connect` consumes the
//! connection: on success the same byte stream becomes the per-device
//! stream, and callers open a fresh mux connection for further requests.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::str::FromStr;

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use log::debug;
use tokio::io::AsyncWriteExt;

use crate::pair_record::PairRecord;
use crate::provider::UsbmuxProvider;
use crate::{DeviceConnection, PowerhouseError, ReadWrite};

mod des;
mod packet;

const CLIENT_VERSION: &str = concat!("powerhouse-", env!("CARGO_PKG_VERSION"));
const PROG_NAME: &str = "powerhouse";

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

impl std::fmt::Display for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usb => write!(f, "USB"),
            Self::Network(_) => write!(f, "Network"),
            Self::Unknown(desc) => write!(f, "{desc}"),
        }
    }
}

/// A device as enumerated by usbmuxd
///
/// The UDID is stable across reconnects; the mux-assigned device ID is only
/// valid while the device stays attached.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    /// How the device is connected
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
    /// USB product ID, zero for network devices
    pub product_id: u32,
}

impl DeviceHandle {
    /// Creates a provider that opens connections to this device
    pub fn to_provider(&self, addr: UsbmuxAddr, label: impl Into<String>) -> UsbmuxProvider {
        UsbmuxProvider::new(addr, self.udid.clone(), self.device_id, label)
    }
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Opens a raw byte stream to the usbmuxd service
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, PowerhouseError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Opens a new usbmuxd connection
    pub async fn connect(&self) -> Result<UsbmuxConnection, PowerhouseError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxConnection::new(socket))
    }

    /// Creates a UsbmuxAddr from the environment
    ///
    /// Checks the `USBMUXD_SOCKET_ADDRESS` environment variable and falls
    /// back to the platform default.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Active connection to the usbmuxd service
pub struct UsbmuxConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

impl UsbmuxConnection {
    /// Connects to usbmuxd at its platform-default address
    pub async fn default() -> Result<Self, PowerhouseError> {
        UsbmuxAddr::default().connect().await
    }

    /// Creates a usbmuxd connection over an established socket
    pub fn new(socket: Box<dyn ReadWrite>) -> Self {
        Self { socket, tag: 0 }
    }

    /// Lists all attached devices
    ///
    /// Entries are returned in the order the muxer reports them.
    pub async fn list_devices(&mut self) -> Result<Vec<DeviceHandle>, PowerhouseError> {
        let req = Self::base_request("ListDevices");
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;
        res.device_list
            .into_iter()
            .map(DeviceHandle::try_from)
            .collect()
    }

    /// Finds a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<DeviceHandle, PowerhouseError> {
        let devices = self.list_devices().await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(PowerhouseError::DeviceNotFound),
        }
    }

    /// Reads the pair record usbmuxd holds for a device
    pub async fn read_pair_record(&mut self, udid: &str) -> Result<PairRecord, PowerhouseError> {
        debug!("Reading pair record for {udid}");
        let mut req = Self::base_request("ReadPairRecord");
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairRecord::from_bytes(d),
            _ => Err(PowerhouseError::PairRecordNotFound),
        }
    }

    /// Reads the system BUID of the muxer
    pub async fn read_buid(&mut self) -> Result<String, PowerhouseError> {
        let req = Self::base_request("ReadBUID");
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(PowerhouseError::UnexpectedResponse),
        }
    }

    /// Opens a stream to a TCP port on the device
    ///
    /// On success the mux socket becomes the per-device stream and this
    /// connection is consumed. A non-zero status from the muxer maps to one
    /// of the `Mux*` errors.
    pub async fn connect(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, PowerhouseError> {
        debug!("Connecting to device {device_id} on port {port}");
        // The muxer wants the 16-bit port in network byte order, widened
        // into the 32-bit PortNumber field.
        let port = port.to_be();

        let mut req = Self::base_request("Connect");
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), (port as u32).into());
        self.write_plist(req).await?;

        match self
            .read_plist()
            .await?
            .get("Number")
            .and_then(|x| x.as_unsigned_integer())
        {
            Some(0) => Ok(DeviceConnection::new(self.socket, label)),
            Some(1) => Err(PowerhouseError::MuxBadCommand),
            Some(2) => Err(PowerhouseError::MuxBadDevice),
            Some(3) => Err(PowerhouseError::MuxConnectionRefused),
            Some(6) => Err(PowerhouseError::MuxBadVersion),
            _ => Err(PowerhouseError::UnexpectedResponse),
        }
    }

    fn base_request(message_type: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), message_type.into());
        req.insert("ClientVersionString".into(), CLIENT_VERSION.into());
        req.insert("ProgName".into(), PROG_NAME.into());
        req.insert("kLibUSBMuxVersion".into(), 3u32.into());
        req
    }

    /// Writes a framed message, stamping it with the next tag
    async fn write_plist(&mut self, req: plist::Dictionary) -> Result<(), PowerhouseError> {
        self.tag += 1;
        let raw = packet::encode(&req, self.tag)?;
        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;
        Ok(())
    }

    /// Reads a framed message and checks its tag against the request
    async fn read_plist(&mut self) -> Result<plist::Dictionary, PowerhouseError> {
        let (tag, res) = packet::read(&mut self.socket).await?;
        if tag != self.tag {
            debug!("Muxer answered tag {tag}, expected {}", self.tag);
            return Err(PowerhouseError::UnexpectedResponse);
        }
        debug!("Read from muxer: {res:?}");
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    async fn read_mux_request(server: &mut DuplexStream) -> (u32, plist::Dictionary) {
        use tokio::io::AsyncReadExt;
        let mut header = [0u8; 16];
        server.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes(header[..4].try_into().unwrap());
        let tag = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut body = vec![0; (len - 16) as usize];
        server.read_exact(&mut body).await.unwrap();
        (tag, plist::from_bytes(&body).unwrap())
    }

    async fn write_mux_response(server: &mut DuplexStream, tag: u32, dict: &plist::Dictionary) {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, dict).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(16 + body.len() as u32).to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&8u32.to_le_bytes());
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&body);
        server.write_all(&out).await.unwrap();
    }

    fn device_entry(device_id: u32, udid: &str, connection_type: &str) -> plist::Value {
        let mut properties = plist::Dictionary::new();
        properties.insert("ConnectionType".into(), connection_type.into());
        properties.insert("SerialNumber".into(), udid.into());
        properties.insert("ProductID".into(), 0x12a8u32.into());
        if connection_type == "Network" {
            let mut sockaddr = vec![0u8; 16];
            sockaddr[0] = 0x10;
            sockaddr[1] = 0x02;
            sockaddr[4..8].copy_from_slice(&[10, 0, 0, 2]);
            properties.insert("NetworkAddress".into(), plist::Value::Data(sockaddr));
        }

        let mut entry = plist::Dictionary::new();
        entry.insert("DeviceID".into(), device_id.into());
        entry.insert("Properties".into(), plist::Value::Dictionary(properties));
        plist::Value::Dictionary(entry)
    }

    #[tokio::test]
    async fn list_devices_preserves_muxer_order() {
        let (client, mut server) = tokio::io::duplex(16384);
        let mut mux = UsbmuxConnection::new(Box::new(client));

        let muxer = tokio::spawn(async move {
            let (tag, req) = read_mux_request(&mut server).await;
            assert_eq!(
                req.get("MessageType").and_then(|x| x.as_string()),
                Some("ListDevices")
            );
            assert_eq!(
                req.get("kLibUSBMuxVersion").and_then(|x| x.as_unsigned_integer()),
                Some(3)
            );

            let mut res = plist::Dictionary::new();
            res.insert(
                "DeviceList".into(),
                plist::Value::Array(vec![
                    device_entry(1, "aaaa", "USB"),
                    device_entry(2, "bbbb", "Network"),
                ]),
            );
            write_mux_response(&mut server, tag, &res).await;
        });

        let devices = mux.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].udid, "aaaa");
        assert_eq!(devices[0].connection_type, Connection::Usb);
        assert_eq!(devices[1].udid, "bbbb");
        assert!(matches!(devices[1].connection_type, Connection::Network(_)));
        muxer.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_tag_is_rejected() {
        let (client, mut server) = tokio::io::duplex(16384);
        let mut mux = UsbmuxConnection::new(Box::new(client));

        let muxer = tokio::spawn(async move {
            let (tag, _req) = read_mux_request(&mut server).await;
            let mut res = plist::Dictionary::new();
            res.insert("BUID".into(), "buid".into());
            write_mux_response(&mut server, tag + 1, &res).await;
        });

        assert!(matches!(
            mux.read_buid().await,
            Err(PowerhouseError::UnexpectedResponse)
        ));
        muxer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_sends_port_in_network_byte_order() {
        let (client, mut server) = tokio::io::duplex(16384);
        let mux = UsbmuxConnection::new(Box::new(client));

        let muxer = tokio::spawn(async move {
            let (tag, req) = read_mux_request(&mut server).await;
            assert_eq!(
                req.get("DeviceID").and_then(|x| x.as_unsigned_integer()),
                Some(3)
            );
            // 62078 == 0xF27E must hit the wire as 0x7EF2 == 32498
            assert_eq!(
                req.get("PortNumber").and_then(|x| x.as_unsigned_integer()),
                Some(62078u16.to_be() as u64)
            );

            let mut res = plist::Dictionary::new();
            res.insert("MessageType".into(), "Result".into());
            res.insert("Number".into(), 0u32.into());
            write_mux_response(&mut server, tag, &res).await;
        });

        let conn = mux.connect(3, 62078, "test").await.unwrap();
        assert_eq!(conn.label(), "test");
        muxer.await.unwrap();
    }

    #[tokio::test]
    async fn connect_maps_refusal_codes() {
        let (client, mut server) = tokio::io::duplex(16384);
        let mux = UsbmuxConnection::new(Box::new(client));

        let muxer = tokio::spawn(async move {
            let (tag, _req) = read_mux_request(&mut server).await;
            let mut res = plist::Dictionary::new();
            res.insert("MessageType".into(), "Result".into());
            res.insert("Number".into(), 3u32.into());
            write_mux_response(&mut server, tag, &res).await;
        });

        assert!(matches!(
            mux.connect(3, 62078, "test").await,
            Err(PowerhouseError::MuxConnectionRefused)
        ));
        muxer.await.unwrap();
    }

    #[tokio::test]
    async fn missing_pair_record_data_is_not_found() {
        let (client, mut server) = tokio::io::duplex(16384);
        let mut mux = UsbmuxConnection::new(Box::new(client));

        let muxer = tokio::spawn(async move {
            let (tag, req) = read_mux_request(&mut server).await;
            assert_eq!(
                req.get("PairRecordID").and_then(|x| x.as_string()),
                Some("aaaa")
            );
            let mut res = plist::Dictionary::new();
            res.insert("MessageType".into(), "Result".into());
            res.insert("Number".into(), 1u32.into());
            write_mux_response(&mut server, tag, &res).await;
        });

        assert!(matches!(
            mux.read_pair_record("aaaa").await,
            Err(PowerhouseError::PairRecordNotFound)
        ));
        muxer.await.unwrap();
    }
}

//! Host-side client for Apple mobile devices.
//!
//! Speaks the local protocol family exposed by the Apple Mobile Device
//! daemon stack: the `usbmuxd` multiplexer, the `lockdownd` control plane on
//! port 62078 and per-session services such as the diagnostics relay. On top
//! of those sits a measurement pipeline that periodically samples battery
//! and backlight telemetry and delivers typed records over a cancellable
//! stream.
//!
//! The layers compose bottom up: [`usbmux::UsbmuxConnection`] enumerates
//! devices and opens per-device streams, [`lockdown::LockdownClient`]
//! negotiates a (possibly TLS) session on such a stream,
//! [`services::diagnostics_relay::DiagnosticsRelayClient`] runs on a second
//! stream handed out by lockdown, and [`device::Device::report_metrics`]
//! owns the whole chain.

use std::io::BufWriter;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod device;
pub mod errors;
pub mod lockdown;
pub mod metrics;
pub mod pair_record;
pub mod provider;
pub mod services;
mod tls;
pub mod usbmux;

pub use device::{Device, Powerhouse};
pub use errors::PowerhouseError;

/// Upper bound for a single frame in either framing, to bound memory.
pub(crate) const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A trait combining all required characteristics for a device communication
/// socket
///
/// Serves as a convenience trait for any type that can be used as an
/// asynchronous read/write socket for device communication. Tokio's
/// `TcpStream` and `UnixStream` implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// A byte stream to lockdownd or to one of its services
///
/// Carries the 4-byte big-endian length-prefixed XML plist framing shared by
/// lockdown and every subordinate service, and can upgrade itself to TLS in
/// the middle of the stream using device pair credentials.
pub struct DeviceConnection {
    /// The underlying socket, boxed for dynamic dispatch. `None` once the
    /// stream has been poisoned or handed to the TLS connector.
    socket: Option<Box<dyn ReadWrite>>,
    /// Client identifier sent in the `Label` field of every request
    label: String,
}

impl DeviceConnection {
    /// Creates a new connection handle over an established socket
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queries the type of the peer daemon
    ///
    /// Sends a `QueryType` request. Lockdownd answers
    /// `"com.apple.mobile.lockdown"` when healthy, which makes this a cheap
    /// liveness probe.
    pub async fn query_type(&mut self) -> Result<String, PowerhouseError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("ProtocolVersion".into(), "2".into());
        req.insert("Request".into(), "QueryType".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;
        let message = self.read_plist().await?;
        match message.get("Type").and_then(|x| x.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(PowerhouseError::UnexpectedResponse),
        }
    }

    /// Sends a plist-formatted message with the service framing
    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), PowerhouseError> {
        let Some(socket) = &mut self.socket else {
            return Err(PowerhouseError::NoEstablishedConnection);
        };
        debug!("Sending plist: {message:?}");

        let mut writer = BufWriter::new(Vec::new());
        message.to_writer_xml(&mut writer)?;
        let body = writer.into_inner().map_err(|e| e.into_error())?;
        let len = body.len() as u32;
        socket.write_all(&len.to_be_bytes()).await?;
        socket.write_all(&body).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads one plist-formatted message with the service framing
    ///
    /// Rejects frames above the transport cap before allocating the payload.
    /// A non-empty `Error` field in the response is mapped to a typed error.
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, PowerhouseError> {
        let Some(socket) = &mut self.socket else {
            return Err(PowerhouseError::NoEstablishedConnection);
        };

        let mut buf = [0u8; 4];
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        if len > MAX_FRAME_LEN {
            return Err(PowerhouseError::OversizedFrame(len));
        }

        let mut body = vec![0; len as usize];
        socket.read_exact(&mut body).await?;
        let res: plist::Dictionary = plist::from_bytes(&body)?;
        debug!("Received plist: {res:?}");

        if let Some(e) = res.get("Error").and_then(|x| x.as_string()) {
            if !e.is_empty() {
                return Err(PowerhouseError::from_device_error_type(e));
            }
        }
        Ok(res)
    }

    /// Upgrades the connection to TLS using device pair credentials
    ///
    /// The handshake runs on the same stream that has carried cleartext
    /// plist traffic so far; no reads may be buffered past the last
    /// response, which holds because [`Self::read_plist`] consumes exactly
    /// one frame.
    pub(crate) async fn enable_tls(
        &mut self,
        pair_record: &pair_record::PairRecord,
        ios_major: u32,
    ) -> Result<(), PowerhouseError> {
        if CryptoProvider::get_default().is_none() {
            if let Err(e) =
                CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
            {
                // Racing installs can make this fail even though a default
                // is now present, so log instead of propagating.
                error!("Failed to set crypto provider: {e:?}");
            }
        }

        let config = tls::client_config(pair_record, ios_major)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let socket = self
            .socket
            .take()
            .ok_or(PowerhouseError::NoEstablishedConnection)?;
        // The device presents its device-local identity; the name here is
        // never checked against the certificate.
        let server_name = ServerName::try_from("Device").expect("static server name");
        let socket = connector.connect(server_name, socket).await?;
        self.socket = Some(Box::new(socket));

        Ok(())
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("label", &self.label)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

/// Runs `fut` under the per-request deadline of the calling layer
///
/// Expiry surfaces as [`PowerhouseError::Timeout`] carrying the operation
/// name and is treated like any other transport error upstream.
pub(crate) async fn with_deadline<T, F>(
    op: &'static str,
    deadline: Duration,
    fut: F,
) -> Result<T, PowerhouseError>
where
    F: std::future::Future<Output = Result<T, PowerhouseError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(PowerhouseError::Timeout(op)),
    }
}


#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::test_util::{read_service_frame, write_service_frame};
    use super::*;

    #[tokio::test]
    async fn read_plist_rejects_oversized_frame_before_allocating() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = DeviceConnection::new(Box::new(client), "test");

        server.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        match conn.read_plist().await {
            Err(PowerhouseError::OversizedFrame(len)) => assert_eq!(len, u32::MAX),
            other => panic!("expected OversizedFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_plist_surfaces_eof_mid_frame() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = DeviceConnection::new(Box::new(client), "test");

        server.write_all(&100u32.to_be_bytes()).await.unwrap();
        server.write_all(b"<plist").await.unwrap();
        drop(server);

        assert!(matches!(
            conn.read_plist().await,
            Err(PowerhouseError::Socket(_))
        ));
    }

    #[tokio::test]
    async fn read_plist_maps_device_error_field() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = DeviceConnection::new(Box::new(client), "test");

        let mut res = plist::Dictionary::new();
        res.insert("Error".into(), "DeviceLocked".into());
        write_service_frame(&mut server, &res).await;

        assert!(matches!(
            conn.read_plist().await,
            Err(PowerhouseError::DeviceLocked)
        ));
    }

    #[tokio::test]
    async fn query_type_round_trip() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = DeviceConnection::new(Box::new(client), "powerhouse");

        let device = tokio::spawn(async move {
            let req = read_service_frame(&mut server).await;
            assert_eq!(
                req.get("Request").and_then(|x| x.as_string()),
                Some("QueryType")
            );
            assert_eq!(
                req.get("Label").and_then(|x| x.as_string()),
                Some("powerhouse")
            );

            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "QueryType".into());
            res.insert("Type".into(), "com.apple.mobile.lockdown".into());
            write_service_frame(&mut server, &res).await;
        });

        let ty = conn.query_type().await.unwrap();
        assert_eq!(ty, "com.apple.mobile.lockdown");
        device.await.unwrap();
    }
}

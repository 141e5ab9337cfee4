//! Diagnostics relay client
//!
//! Runs on a service channel obtained from
//! `StartService("com.apple.mobile.diagnostics_relay")` and exposes the
//! device's IORegistry, the kernel object graph whose entries (such as
//! `AppleSmartBattery`) carry telemetry dictionaries.

use std::time::Duration;

use crate::{with_deadline, DeviceConnection, PowerhouseError};

/// The service name as registered with lockdownd
pub const SERVICE_NAME: &str = "com.apple.mobile.diagnostics_relay";

/// Deadline for a single relay request
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

/// Client for the diagnostics relay
///
/// One request may be outstanding per channel at a time; the API takes
/// `&mut self` for every request, which makes that structural.
#[derive(Debug)]
pub struct DiagnosticsRelayClient {
    conn: DeviceConnection,
}

impl DiagnosticsRelayClient {
    /// Creates a relay client from an established service channel
    pub fn new(conn: DeviceConnection) -> Self {
        Self { conn }
    }

    /// Requests an entry from the IO registry
    ///
    /// Exactly one of `entry_name` and `entry_class` selects the entry;
    /// passing both or neither is a misuse and nothing is sent.
    ///
    /// # Returns
    /// The decoded `Diagnostics.IORegistry` dictionary, or `None` when the
    /// device answered success without a payload.
    pub async fn ioregistry(
        &mut self,
        entry_name: Option<&str>,
        entry_class: Option<&str>,
    ) -> Result<Option<plist::Dictionary>, PowerhouseError> {
        let mut req = plist::Dictionary::new();
        match (entry_name, entry_class) {
            (Some(name), None) => {
                req.insert("EntryName".into(), name.into());
            }
            (None, Some(class)) => {
                req.insert("EntryClass".into(), class.into());
            }
            _ => {
                return Err(PowerhouseError::ProtocolMisuse(
                    "exactly one of entry name and entry class must be given",
                ))
            }
        }
        req.insert("Request".into(), "IORegistry".into());

        let mut res = with_deadline("read io registry", REQUEST_DEADLINE, async {
            self.conn.send_plist(plist::Value::Dictionary(req)).await?;
            self.conn.read_plist().await
        })
        .await?;

        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Success") => {}
            _ => return Err(PowerhouseError::UnexpectedResponse),
        }

        let res = res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("IORegistry"))
            .and_then(|x| x.into_dictionary());

        Ok(res)
    }

    /// Announces the end of the conversation
    ///
    /// Issued on close; the device acknowledges with a status that is read
    /// but not interpreted beyond error mapping.
    pub async fn goodbye(&mut self) -> Result<(), PowerhouseError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), "Goodbye".into());

        with_deadline("goodbye", REQUEST_DEADLINE, async {
            self.conn.send_plist(plist::Value::Dictionary(req)).await?;
            self.conn.read_plist().await
        })
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{read_service_frame, write_service_frame};

    fn client_pair() -> (DiagnosticsRelayClient, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(16384);
        let conn = DeviceConnection::new(Box::new(client), "powerhouse");
        (DiagnosticsRelayClient::new(conn), server)
    }

    #[tokio::test]
    async fn both_selectors_is_a_misuse_and_sends_nothing() {
        let (mut relay, mut server) = client_pair();

        assert!(matches!(
            relay.ioregistry(Some("AppleSmartBattery"), Some("IOService")).await,
            Err(PowerhouseError::ProtocolMisuse(_))
        ));
        assert!(matches!(
            relay.ioregistry(None, None).await,
            Err(PowerhouseError::ProtocolMisuse(_))
        ));

        // Nothing must have hit the wire
        drop(relay);
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn ioregistry_extracts_diagnostics_payload() {
        let (mut relay, mut server) = client_pair();

        let device = tokio::spawn(async move {
            let req = read_service_frame(&mut server).await;
            assert_eq!(
                req.get("Request").and_then(|x| x.as_string()),
                Some("IORegistry")
            );
            assert_eq!(
                req.get("EntryName").and_then(|x| x.as_string()),
                Some("AppleSmartBattery")
            );
            assert!(req.get("EntryClass").is_none());

            let mut registry = plist::Dictionary::new();
            registry.insert("CycleCount".into(), 123u32.into());
            let mut diagnostics = plist::Dictionary::new();
            diagnostics.insert("IORegistry".into(), plist::Value::Dictionary(registry));
            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "IORegistry".into());
            res.insert("Status".into(), "Success".into());
            res.insert("Diagnostics".into(), plist::Value::Dictionary(diagnostics));
            write_service_frame(&mut server, &res).await;
        });

        let registry = relay
            .ioregistry(Some("AppleSmartBattery"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            registry.get("CycleCount").and_then(|x| x.as_unsigned_integer()),
            Some(123)
        );
        device.await.unwrap();
    }

    #[tokio::test]
    async fn failure_status_is_unexpected() {
        let (mut relay, mut server) = client_pair();

        let device = tokio::spawn(async move {
            let _req = read_service_frame(&mut server).await;
            let mut res = plist::Dictionary::new();
            res.insert("Status".into(), "UnknownRequest".into());
            write_service_frame(&mut server, &res).await;
        });

        assert!(matches!(
            relay.ioregistry(None, Some("IOService")).await,
            Err(PowerhouseError::UnexpectedResponse)
        ));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn goodbye_round_trip() {
        let (mut relay, mut server) = client_pair();

        let device = tokio::spawn(async move {
            let req = read_service_frame(&mut server).await;
            assert_eq!(
                req.get("Request").and_then(|x| x.as_string()),
                Some("Goodbye")
            );
            let mut res = plist::Dictionary::new();
            res.insert("Request".into(), "Goodbye".into());
            res.insert("Status".into(), "Success".into());
            write_service_frame(&mut server, &res).await;
        });

        relay.goodbye().await.unwrap();
        device.await.unwrap();
    }
}

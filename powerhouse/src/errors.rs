//! Error type shared by every layer of the stack.

use std::io;

use thiserror::Error;

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PowerhouseError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("frame of {0} bytes exceeds the transport cap")]
    OversizedFrame(u32),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Rustls(#[from] rustls::Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("device not found")]
    DeviceNotFound,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have a pair record for this host")]
    InvalidHostID,
    #[error("device is locked")]
    DeviceLocked,
    #[error("lockdown returned an error: {0}")]
    Lockdown(String),
    #[error("muxer rejected the command")]
    MuxBadCommand,
    #[error("muxer rejected the device")]
    MuxBadDevice,
    #[error("muxer refused the connection")]
    MuxConnectionRefused,
    #[error("muxer version mismatch")]
    MuxBadVersion,
    #[error("pair record not found")]
    PairRecordNotFound,
    #[error("pair record is malformed")]
    PairRecordMalformed,
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),
    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError),
}

impl PowerhouseError {
    /// Converts a device-reported error string to a typed error
    ///
    /// Strings without a known mapping are surfaced verbatim as
    /// [`PowerhouseError::Lockdown`].
    pub(crate) fn from_device_error_type(e: &str) -> Self {
        match e {
            "GetProhibited" => Self::GetProhibited,
            "InvalidHostID" => Self::InvalidHostID,
            "SessionInactive" => Self::SessionInactive,
            "DeviceLocked" => Self::DeviceLocked,
            _ => Self::Lockdown(e.to_string()),
        }
    }

    /// Whether the error poisons the underlying transport.
    ///
    /// Fatal errors terminate the enclosing client; the rest only fail the
    /// current request and the connection remains usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Socket(_)
                | Self::Timeout(_)
                | Self::OversizedFrame(_)
                | Self::Rustls(_)
                | Self::PemParseFailed(_)
                | Self::NoEstablishedConnection
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_device_errors_map_to_typed_variants() {
        assert!(matches!(
            PowerhouseError::from_device_error_type("DeviceLocked"),
            PowerhouseError::DeviceLocked
        ));
        assert!(matches!(
            PowerhouseError::from_device_error_type("SessionInactive"),
            PowerhouseError::SessionInactive
        ));
        match PowerhouseError::from_device_error_type("PasswordProtected") {
            PowerhouseError::Lockdown(msg) => assert_eq!(msg, "PasswordProtected"),
            other => panic!("expected Lockdown, got {other:?}"),
        }
    }

    #[test]
    fn transport_errors_are_fatal() {
        assert!(PowerhouseError::Timeout("read io registry").is_fatal());
        assert!(PowerhouseError::OversizedFrame(u32::MAX).is_fatal());
        assert!(!PowerhouseError::Lockdown("DeviceLocked".into()).is_fatal());
        assert!(!PowerhouseError::UnexpectedResponse.is_fatal());
    }
}

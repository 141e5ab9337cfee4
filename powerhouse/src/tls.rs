//! TLS configuration for lockdown sessions and service channels
//!
//! The device presents its device-local identity, so hostname verification
//! is meaningless here; trust is rooted exclusively in the certificates of
//! the pair record. See <https://github.com/rustls/rustls/issues/578> for
//! why this needs a custom verifier.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SupportedProtocolVersion};

use crate::pair_record::PairRecord;
use crate::PowerhouseError;

/// Trusts exactly the certificates recorded during pairing
///
/// The presented end-entity certificate must be the pair record's device or
/// root certificate, byte for byte. Server name and validity window are not
/// checked; the device cert is self-issued and devices with dead batteries
/// tend to have wildly wrong clocks.
#[derive(Debug)]
struct PairRecordVerifier {
    device_certificate: CertificateDer<'static>,
    root_certificate: CertificateDer<'static>,
}

impl PairRecordVerifier {
    fn new(pair_record: &PairRecord) -> Self {
        Self {
            device_certificate: pair_record.device_certificate.clone(),
            root_certificate: pair_record.root_certificate.clone(),
        }
    }
}

impl ServerCertVerifier for PairRecordVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if *end_entity == self.device_certificate || *end_entity == self.root_certificate {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        // Older devices sign with schemes modern defaults would refuse
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA1,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Protocol versions acceptable for the given iOS major version
///
/// iOS 14 and later negotiate TLS 1.2 or 1.3. Older releases only speak up
/// to TLS 1.2 reliably, so they are pinned there (the TLS backend does not
/// implement TLS 1.0 at all).
pub(crate) fn protocol_versions(ios_major: u32) -> &'static [&'static SupportedProtocolVersion] {
    if ios_major >= 14 {
        rustls::ALL_VERSIONS
    } else {
        static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
        TLS12_ONLY
    }
}

/// Builds the client configuration for a handshake against the device
pub(crate) fn client_config(
    pair_record: &PairRecord,
    ios_major: u32,
) -> Result<ClientConfig, PowerhouseError> {
    let private_key = PrivateKeyDer::from_pem_slice(&pair_record.host_private_key)?;

    let mut config = ClientConfig::builder_with_protocol_versions(protocol_versions(ios_major))
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PairRecordVerifier::new(pair_record)))
        .with_client_auth_cert(vec![pair_record.host_certificate.clone()], private_key)?;

    // No resumption or session tickets; every channel handshakes fresh.
    config.resumption = rustls::client::Resumption::disabled();

    Ok(config)
}

//! # TLS Infrastructure
//!
//! Certificate generation and verification for mutually authenticated QUIC.
//!
//! ## Identity Model
//!
//! - **NodeId = Public Key**: the 32-byte Ed25519 key in the certificate's
//!   SubjectPublicKeyInfo IS the peer's identity
//! - **Self-Signed Certs**: each node derives its certificate from its keypair
//! - **Subject binding**: the certificate CN carries the hex-encoded public key
//!   and must agree with the SPKI, otherwise the peer is rejected
//! - **Mutual Auth**: both sides present and verify certificates
//!
//! Dialers usually know only an address, not the peer's NodeId, so the server
//! verifier accepts any well-formed Ed25519 identity and the NodeId is read
//! back from the verified certificate after the handshake.
//!
//! ## SECURITY WARNING
//!
//! The `dangerous()` APIs are used intentionally - verification binds the
//! identity to the public key, not to a CA-signed chain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::error::NetworkError;
use crate::identity::{Keypair, NodeId};

/// Lazily-initialized crypto provider for rustls (ring backend).
static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for gateway sessions.
pub const ALPN: &[u8] = b"meshgate/1";

/// TLS server name used when dialing. Identity is not encoded in it.
pub const SERVER_NAME: &str = "meshgate";

/// Idle timeout applied to every QUIC connection. Heartbeats keep live
/// sessions well below it.
pub const QUIC_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    build_certificate(keypair, &hex::encode(keypair.public_key_bytes()))
}

fn build_certificate(
    keypair: &Keypair,
    common_name: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    // PKCS#8 v1: SEQUENCE { version, AlgorithmIdentifier { OID }, OCTET STRING { OCTET STRING key } }
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(common_name.to_string()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let mut transport_config = quinn::TransportConfig::default();
    transport_config.max_idle_timeout(Some(
        QUIC_IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of VarInt range")?,
    ));
    transport_config.max_concurrent_bidi_streams(8u32.into());
    transport_config.max_concurrent_uni_streams(0u32.into());
    server_config.transport_config(Arc::new(transport_config));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));

    let mut transport_config = quinn::TransportConfig::default();
    transport_config.max_idle_timeout(Some(
        QUIC_IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of VarInt range")?,
    ));
    client_config.transport_config(Arc::new(transport_config));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// First common name in the certificate subject, if any.
pub fn common_name_from_cert(cert_der: &[u8]) -> Option<String> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

/// Derive the peer's NodeId from its certificate.
///
/// The SPKI must be a valid Ed25519 key and the subject CN must be its hex
/// encoding.
pub fn verify_peer_certificate(cert_der: &[u8]) -> Result<NodeId, NetworkError> {
    let public_key = extract_public_key_from_cert(cert_der)
        .ok_or_else(|| NetworkError::HandshakeFailed("certificate has no Ed25519 key".into()))?;
    let node_id = NodeId::from_bytes(public_key);
    if !node_id.is_valid() {
        return Err(NetworkError::HandshakeFailed(
            "certificate key is not a valid Ed25519 point".into(),
        ));
    }

    let common_name = common_name_from_cert(cert_der)
        .ok_or_else(|| NetworkError::HandshakeFailed("certificate subject has no CN".into()))?;
    if !common_name.eq_ignore_ascii_case(&node_id.to_hex()) {
        return Err(NetworkError::HandshakeFailed(
            "certificate subject does not match its public key".into(),
        ));
    }

    Ok(node_id)
}

pub fn extract_verified_identity(connection: &quinn::Connection) -> Result<NodeId, NetworkError> {
    let missing = || NetworkError::HandshakeFailed("peer presented no certificate".into());
    let peer_identity = connection.peer_identity().ok_or_else(missing)?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref().ok_or_else(missing)?;
    let cert_der = certs.first().ok_or_else(missing)?;
    verify_peer_certificate(cert_der.as_ref())
}

fn to_rustls_error(err: NetworkError) -> rustls::Error {
    rustls::Error::General(err.to_string())
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        verify_peer_certificate(end_entity.as_ref()).map_err(to_rustls_error)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        verify_peer_certificate(end_entity.as_ref()).map_err(to_rustls_error)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

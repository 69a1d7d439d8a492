//! Trust configuration for both roles.
//!
//! The client pins the server: its root store is seeded only from the
//! certificate material it was given, never from a public CA bundle. The
//! server presents a single certificate/key identity and does not ask
//! clients for certificates.

use std::{fmt, io::BufReader, sync::Arc};

use rustls::{
    crypto::{aws_lc_rs, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
    version::{TLS12, TLS13},
    ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion,
};
use rustls_pemfile::{certs, private_key};

use crate::{error::EchoError, protocol::ALPN_PROTOCOL};

/// Protocol versions offered by both sides; TLS 1.2 is the floor.
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(aws_lc_rs::default_provider())
}

/// Client-side set of pinned certificates. Never empty.
#[derive(Debug, Clone)]
pub struct TrustStore {
    roots: RootCertStore,
}

impl TrustStore {
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Builds the TLS client configuration that only accepts peers chaining
    /// to this store.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, EchoError> {
        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| EchoError::TrustConfig(format!("unsupported protocol versions: {e}")))?
            .with_root_certificates(self.roots.clone())
            .with_no_client_auth();
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        Ok(Arc::new(config))
    }
}

/// Server certificate chain and private key, proven to match.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key:        PrivateKeyDer<'static>,
}

impl Identity {
    /// The end-entity certificate presented to every client.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Builds the TLS server configuration presenting this identity.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, EchoError> {
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| EchoError::TrustConfig(format!("unsupported protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| EchoError::TrustConfig(format!("failed to build server config: {e}")))?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        Ok(Arc::new(config))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, EchoError> {
    certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EchoError::TrustConfig(format!("failed to parse certificate PEM: {e}")))
}

/// Builds the client's pinned trust store from PEM certificate bytes.
///
/// Fails unless at least one certificate parses and is accepted as a trust
/// anchor.
pub fn build_client_trust(cert_pem: &[u8]) -> Result<TrustStore, EchoError> {
    let parsed = parse_certs(cert_pem)?;
    if parsed.is_empty() {
        return Err(EchoError::TrustConfig(
            "no certificate found in PEM data".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(parsed);
    if ignored > 0 {
        tracing::warn!("Ignored {} unparsable certificate(s) in trust material", ignored);
    }
    if added == 0 {
        return Err(EchoError::TrustConfig(
            "no valid certificate could be added to the trust store".to_string(),
        ));
    }

    tracing::debug!("Pinned {} certificate(s)", added);
    Ok(TrustStore { roots })
}

/// Builds the server identity from PEM certificate and key bytes.
///
/// Fails if either side does not parse or if the key does not belong to the
/// end-entity certificate.
pub fn build_server_identity(cert_pem: &[u8], key_pem: &[u8]) -> Result<Identity, EchoError> {
    let cert_chain = parse_certs(cert_pem)?;
    if cert_chain.is_empty() {
        return Err(EchoError::TrustConfig(
            "no certificate found in PEM data".to_string(),
        ));
    }

    let key = private_key(&mut BufReader::new(key_pem))
        .map_err(|e| EchoError::TrustConfig(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| EchoError::TrustConfig("no private key found in PEM data".to_string()))?;

    let signing_key = crypto_provider()
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| EchoError::TrustConfig(format!("unsupported private key: {e}")))?;
    CertifiedKey::new(cert_chain.clone(), signing_key)
        .keys_match()
        .map_err(|e| EchoError::TrustConfig(format!("certificate and key do not match: {e}")))?;

    Ok(Identity { cert_chain, key })
}

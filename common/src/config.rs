use std::{env, path::PathBuf, time::Duration};

use crate::error::EchoError;

const SSL_CERT_ENV: &str = "SSL_CERT";
const SSL_KEY_ENV: &str = "SSL_KEY";
const PORT_ENV: &str = "PORT";
const SRV_URL_ENV: &str = "SRV_URL";
const SHUTDOWN_GRACE_ENV: &str = "SHUTDOWN_GRACE_SECS";
const CALL_TIMEOUT_ENV: &str = "CALL_TIMEOUT_SECS";
const CONNECT_TIMEOUT_ENV: &str = "CONNECT_TIMEOUT_SECS";

const DEFAULT_CERTS_DIR: &str = "certs";
const DEFAULT_PORT: &str = ":8080";
const DEFAULT_ENDPOINT: &str = "localhost:8080";
const DEFAULT_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn secs_var(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration, EchoError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| EchoError::Config(format!("{name}={raw:?} is not a number of seconds: {e}"))),
        None => Ok(default),
    }
}

/// Turns `:8080`, `8080` or `host:8080` into a bindable address. Bare ports
/// bind every interface.
pub fn normalize_listen_addr(port: &str) -> String {
    let port = port.trim();
    if let Some(bare) = port.strip_prefix(':') {
        format!("0.0.0.0:{bare}")
    } else if port.chars().all(|c| c.is_ascii_digit()) {
        format!("0.0.0.0:{port}")
    } else {
        port.to_string()
    }
}

/// Everything the server needs before it can start.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// PEM certificate chain presented to clients
    pub cert_path:    PathBuf,
    /// PEM private key matching `cert_path`
    pub key_path:     PathBuf,
    /// Address the listener binds to
    pub listen_addr:  String,
    /// Time in-flight calls get to finish once shutdown starts
    pub grace_period: Duration,
}

impl ServerSettings {
    /// Reads `SSL_CERT`, `SSL_KEY`, `PORT` and `SHUTDOWN_GRACE_SECS`,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, EchoError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EchoError> {
        let certs = PathBuf::from(DEFAULT_CERTS_DIR);
        Ok(Self {
            cert_path:    lookup(SSL_CERT_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| certs.join("server.pem")),
            key_path:     lookup(SSL_KEY_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| certs.join("server.key.pem")),
            listen_addr:  normalize_listen_addr(
                &lookup(PORT_ENV).unwrap_or_else(|| DEFAULT_PORT.to_string()),
            ),
            grace_period: secs_var(&lookup, SHUTDOWN_GRACE_ENV, DEFAULT_GRACE)?,
        })
    }

    pub fn with_cert_path(mut self, cert_path: impl Into<PathBuf>) -> Self {
        self.cert_path = cert_path.into();
        self
    }

    pub fn with_key_path(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = key_path.into();
        self
    }

    pub fn with_listen_addr(mut self, addr: &str) -> Self {
        self.listen_addr = normalize_listen_addr(addr);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

/// Everything the client needs before it can connect.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// PEM certificate of the server, pinned as the only trust anchor
    pub cert_path:       PathBuf,
    /// `host:port` of the server; the host part is also the TLS server name
    pub endpoint:        String,
    /// Budget for a single call
    pub call_timeout:    Duration,
    /// Budget for TCP connect plus TLS handshake
    pub connect_timeout: Duration,
}

impl ClientSettings {
    /// Reads `SSL_CERT`, `SRV_URL`, `CALL_TIMEOUT_SECS` and
    /// `CONNECT_TIMEOUT_SECS`, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, EchoError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EchoError> {
        Ok(Self {
            cert_path:       lookup(SSL_CERT_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CERTS_DIR).join("server.pem")),
            endpoint:        lookup(SRV_URL_ENV).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            call_timeout:    secs_var(&lookup, CALL_TIMEOUT_ENV, DEFAULT_CALL_TIMEOUT)?,
            connect_timeout: secs_var(&lookup, CONNECT_TIMEOUT_ENV, DEFAULT_CONNECT_TIMEOUT)?,
        })
    }

    pub fn new(cert_path: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        Self {
            cert_path:       cert_path.into(),
            endpoint:        endpoint.into(),
            call_timeout:    DEFAULT_CALL_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_cert_path(mut self, cert_path: impl Into<PathBuf>) -> Self {
        self.cert_path = cert_path.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

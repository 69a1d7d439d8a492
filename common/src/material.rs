use std::{fs, path::Path};

use crate::error::EchoError;

/// Reads raw certificate or key bytes from `path`.
///
/// There is no retry: a missing or unreadable file is fatal to startup.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<u8>, EchoError> {
    let path = path.as_ref();
    tracing::debug!("Reading TLS material from {:?}", path);
    fs::read(path).map_err(|source| EchoError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// PEM bytes a client needs to pin the server: the server certificate.
pub struct ClientMaterial {
    pub cert: Vec<u8>,
}

impl ClientMaterial {
    pub fn load(cert_path: impl AsRef<Path>) -> Result<Self, EchoError> {
        Ok(Self {
            cert: load(cert_path)?,
        })
    }
}

/// PEM bytes a server presents: its certificate chain and private key.
pub struct ServerMaterial {
    pub cert: Vec<u8>,
    pub key:  Vec<u8>,
}

impl ServerMaterial {
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, EchoError> {
        Ok(Self {
            cert: load(cert_path)?,
            key:  load(key_path)?,
        })
    }
}

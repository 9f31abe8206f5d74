//! TLS configuration and the secured transport variant.
//!
//! Certificate and key material is loaded eagerly when the server is
//! constructed, so a misconfigured deployment fails at startup instead of on
//! the first client handshake.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::ServerConnection;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{ServerError, ServerResult};

/// TLS configuration for the server.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the certificate chain file (PEM format).
    pub cert_path: PathBuf,
    /// Path to the private key file (PEM format).
    pub key_path: PathBuf,
}

impl TlsConfig {
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Builds a rustls `ServerConfig` from this configuration.
    pub fn build_server_config(&self) -> ServerResult<Arc<rustls::ServerConfig>> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ServerError::Tls(e.to_string()))?;

        Ok(Arc::new(config))
    }
}

/// Loads the certificate chain from a PEM file.
fn load_certs(path: &Path) -> ServerResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        ServerError::Tls(format!(
            "failed to read certificate file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| {
            ServerError::Tls(format!("failed to parse PEM file {}: {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Loads a private key (PKCS#8, PKCS#1, or SEC1) from a PEM file.
fn load_private_key(path: &Path) -> ServerResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        ServerError::Tls(format!("failed to read key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            ServerError::Tls(format!("failed to parse PEM file {}: {}", path.display(), e))
        })?
        .ok_or_else(|| ServerError::Tls(format!("no private key found in {}", path.display())))
}

/// A TLS-wrapped non-blocking stream.
///
/// The handshake is driven lazily from `read`/`write`: until it completes,
/// both return `WouldBlock` and the event loop retries on the next readiness
/// notification.
pub struct TlsStream {
    socket: TcpStream,
    conn: ServerConnection,
}

impl TlsStream {
    pub fn new(socket: TcpStream, config: Arc<rustls::ServerConfig>) -> ServerResult<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| ServerError::Tls(format!("failed to create TLS connection: {e}")))?;

        Ok(Self { socket, conn })
    }

    /// Access to the underlying socket for poll registration.
    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }

    /// Advances the handshake as far as the socket allows.
    ///
    /// Returns `Ok(true)` once the handshake is complete.
    fn advance_handshake(&mut self) -> io::Result<bool> {
        while self.conn.is_handshaking() {
            let mut progressed = false;

            while self.conn.wants_write() {
                match self.conn.write_tls(&mut self.socket) {
                    Ok(0) => break,
                    Ok(_) => progressed = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }

            if self.conn.is_handshaking() && self.conn.wants_read() {
                match self.conn.read_tls(&mut self.socket) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed during TLS handshake",
                        ));
                    }
                    Ok(_) => {
                        self.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }

            if !progressed {
                break;
            }
        }

        Ok(!self.conn.is_handshaking())
    }

    /// Flushes buffered TLS records to the socket.
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut self.socket) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.advance_handshake()? {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        while self.conn.wants_read() {
            match self.conn.read_tls(&mut self.socket) {
                Ok(0) => break,
                Ok(_) => {
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        self.conn.reader().read(buf)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.advance_handshake()? {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }

        let written = self.conn.writer().write(buf)?;
        self.flush_tls()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_tls()?;
        self.socket.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn config_stores_paths() {
        let config = TlsConfig::new("/path/to/cert.pem", "/path/to/key.pem");
        assert_eq!(config.cert_path.to_str(), Some("/path/to/cert.pem"));
        assert_eq!(config.key_path.to_str(), Some("/path/to/key.pem"));
    }

    #[test]
    fn missing_cert_file_fails_at_construction() {
        let config = TlsConfig::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = config.build_server_config().unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
        assert!(err.to_string().contains("cert.pem"));
    }

    #[test]
    fn garbage_pem_fails_at_construction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("cert.pem");
        let mut file = File::create(&cert_path).expect("create file");
        file.write_all(b"this is not pem data").expect("write");

        let config = TlsConfig::new(&cert_path, &cert_path);
        let err = config.build_server_config().unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }
}

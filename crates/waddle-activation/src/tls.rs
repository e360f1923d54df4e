//! TLS termination for inherited TCP listeners.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::error::{Error, Result};
use crate::listener::Listener;

/// A TCP listener whose accepted connections go through a TLS handshake.
///
/// Holds a plain [`std::net::TcpListener`] so it can be built outside a
/// runtime; use [`into_tokio`](Self::into_tokio) to start accepting.
pub struct TlsListener {
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Wrap `listener` with the given server configuration.
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            listener,
            acceptor: TlsAcceptor::from(config),
        }
    }

    /// The underlying TCP listener.
    pub fn get_ref(&self) -> &TcpListener {
        &self.listener
    }

    /// The acceptor used for handshakes.
    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Local address of the underlying listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Drop TLS and return the plain listener.
    pub fn into_inner(self) -> TcpListener {
        self.listener
    }

    /// Register with the current tokio runtime.
    pub fn into_tokio(self) -> io::Result<TokioTlsListener> {
        self.listener.set_nonblocking(true)?;
        Ok(TokioTlsListener {
            listener: tokio::net::TcpListener::from_std(self.listener)?,
            acceptor: self.acceptor,
        })
    }
}

impl fmt::Debug for TlsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsListener")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl AsFd for TlsListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }
}

/// Async counterpart of [`TlsListener`].
pub struct TokioTlsListener {
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
}

impl TokioTlsListener {
    /// Accept a connection and complete the TLS handshake.
    pub async fn accept(&self) -> io::Result<(TlsStream<TcpStream>, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let stream = self.acceptor.accept(stream).await?;
        Ok((stream, peer_addr))
    }

    /// Local address of the underlying listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl fmt::Debug for TokioTlsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTlsListener")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// Wrap every TCP listener in `listeners` with TLS.
///
/// UDP / Unix-domain listeners and empty slots are left as they are.
pub fn wrap_tls(
    listeners: Vec<Option<Listener>>,
    config: Arc<ServerConfig>,
) -> Vec<Option<Listener>> {
    listeners
        .into_iter()
        .map(|slot| slot.map(|listener| listener.with_tls(Arc::clone(&config))))
        .collect()
}

/// Load a TLS server configuration from PEM certificate and key files.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_file = File::open(cert_path).map_err(|e| {
        Error::tls(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        Error::tls(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::tls(format!("Invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| Error::tls(format!("Invalid key PEM: {}", e)))?
        .ok_or_else(|| Error::tls(format!("No private key found in {}", key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::tls(format!("TLS config error: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("TLS config error: {}", e)))?;

    Ok(Arc::new(config))
}

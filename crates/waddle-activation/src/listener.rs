//! Listener adaptation for inherited sockets.
//!
//! Turns inherited fds into typed listeners. Order is preserved: slot `i`
//! of the result always corresponds to fd `3 + i`. An fd that cannot be
//! adapted (not a socket, unsupported family) leaves `None` in its slot
//! instead of failing the batch, so callers can still match slots to the
//! sockets they expect.

use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::debug;

use crate::env::{Environment, ProcessEnvironment};
use crate::error::Result;
use crate::files::{files_with_names_in, NamedFd};
use crate::tls::{wrap_tls, TlsListener, TokioTlsListener};

/// Transport of a listener, as reported by the socket itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// Stream socket over IPv4 / IPv6
    Tcp,
    /// Datagram socket over IPv4 / IPv6
    Udp,
    /// Unix-domain stream socket
    Unix,
    /// Unix-domain datagram socket
    Unixgram,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
            Network::Unixgram => "unixgram",
        })
    }
}

/// An inherited socket, typed by what the kernel says it is.
#[derive(Debug)]
pub enum Listener {
    /// TCP listening socket
    Tcp(TcpListener),
    /// Unix-domain stream listening socket
    Unix(UnixListener),
    /// UDP socket
    Udp(UdpSocket),
    /// Unix-domain datagram socket
    UnixDatagram(UnixDatagram),
    /// TCP listening socket whose connections are TLS-terminated
    Tls(TlsListener),
}

impl Listener {
    /// Adopt a socket fd.
    ///
    /// Fails if `fd` is not a socket, or is a socket of a kind we don't
    /// adapt (seqpacket, netlink, ...). The fd is closed on failure.
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let sock_type = socket_type(raw)?;
        let family = socket_family(raw)?;

        match (sock_type, family) {
            (libc::SOCK_STREAM, libc::AF_INET | libc::AF_INET6) => {
                Ok(Listener::Tcp(TcpListener::from(fd)))
            }
            (libc::SOCK_STREAM, libc::AF_UNIX) => Ok(Listener::Unix(UnixListener::from(fd))),
            (libc::SOCK_DGRAM, libc::AF_INET | libc::AF_INET6) => {
                Ok(Listener::Udp(UdpSocket::from(fd)))
            }
            (libc::SOCK_DGRAM, libc::AF_UNIX) => Ok(Listener::UnixDatagram(UnixDatagram::from(fd))),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported socket (type {sock_type}, family {family})"),
            )),
        }
    }

    /// Transport of this listener. TLS listeners report [`Network::Tcp`].
    pub fn network(&self) -> Network {
        match self {
            Listener::Tcp(_) | Listener::Tls(_) => Network::Tcp,
            Listener::Unix(_) => Network::Unix,
            Listener::Udp(_) => Network::Udp,
            Listener::UnixDatagram(_) => Network::Unixgram,
        }
    }

    /// Whether connections on this listener are TLS-terminated.
    pub fn is_tls(&self) -> bool {
        matches!(self, Listener::Tls(_))
    }

    /// Wrap a TCP listener in TLS. Other listeners are returned unchanged.
    pub fn with_tls(self, config: Arc<ServerConfig>) -> Self {
        match self {
            Listener::Tcp(listener) => Listener::Tls(TlsListener::new(listener, config)),
            other => other,
        }
    }

    /// Register with the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn into_tokio(self) -> io::Result<TokioListener> {
        Ok(match self {
            Listener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                TokioListener::Tcp(tokio::net::TcpListener::from_std(listener)?)
            }
            Listener::Unix(listener) => {
                listener.set_nonblocking(true)?;
                TokioListener::Unix(tokio::net::UnixListener::from_std(listener)?)
            }
            Listener::Udp(socket) => {
                socket.set_nonblocking(true)?;
                TokioListener::Udp(tokio::net::UdpSocket::from_std(socket)?)
            }
            Listener::UnixDatagram(socket) => {
                socket.set_nonblocking(true)?;
                TokioListener::UnixDatagram(tokio::net::UnixDatagram::from_std(socket)?)
            }
            Listener::Tls(listener) => TokioListener::Tls(listener.into_tokio()?),
        })
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Tcp(l) => l.as_fd(),
            Listener::Unix(l) => l.as_fd(),
            Listener::Udp(s) => s.as_fd(),
            Listener::UnixDatagram(s) => s.as_fd(),
            Listener::Tls(l) => l.as_fd(),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// A [`Listener`] registered with tokio.
#[derive(Debug)]
pub enum TokioListener {
    /// TCP listening socket
    Tcp(tokio::net::TcpListener),
    /// Unix-domain stream listening socket
    Unix(tokio::net::UnixListener),
    /// UDP socket
    Udp(tokio::net::UdpSocket),
    /// Unix-domain datagram socket
    UnixDatagram(tokio::net::UnixDatagram),
    /// TLS-terminating TCP listener
    Tls(TokioTlsListener),
}

/// A listener slot paired with the name the supervisor gave its fd.
#[derive(Debug)]
pub struct NamedListener {
    /// The listener, or `None` if the fd could not be adapted
    pub listener: Option<Listener>,
    /// Name from `LISTEN_FDNAMES`, empty if none was given
    pub name: String,
}

/// Adopt every inherited fd as a listener, keeping names.
///
/// Fails only if `LISTEN_FDNAMES` cannot be read; an fd that is not a
/// usable socket yields a `None` slot.
pub fn listeners_with_names(unset_env: bool) -> Result<Vec<NamedListener>> {
    listeners_with_names_in(&ProcessEnvironment, unset_env)
}

/// [`listeners_with_names`] against an explicit environment.
pub fn listeners_with_names_in(
    env: &dyn Environment,
    unset_env: bool,
) -> Result<Vec<NamedListener>> {
    let named = files_with_names_in(env, unset_env)?;
    Ok(adapt(named))
}

/// Adopt every inherited fd as a listener.
///
/// The order of fds is preserved. For example if the supervisor passed
/// "tcp, file, tcp", the result is `[Some(Tcp), None, Some(Tcp)]`.
pub fn listeners(unset_env: bool) -> Result<Vec<Option<Listener>>> {
    listeners_in(&ProcessEnvironment, unset_env)
}

/// [`listeners`] against an explicit environment.
pub fn listeners_in(env: &dyn Environment, unset_env: bool) -> Result<Vec<Option<Listener>>> {
    Ok(listeners_with_names_in(env, unset_env)?
        .into_iter()
        .map(|named| named.listener)
        .collect())
}

/// Adopt every inherited fd as a listener, terminating TLS on TCP ones.
///
/// Only TCP listeners are wrapped; UDP and Unix-domain sockets and empty
/// slots pass through. Without a `tls_config` this is [`listeners`].
pub fn tls_listeners(
    unset_env: bool,
    tls_config: Option<Arc<ServerConfig>>,
) -> Result<Vec<Option<Listener>>> {
    tls_listeners_in(&ProcessEnvironment, unset_env, tls_config)
}

/// [`tls_listeners`] against an explicit environment.
pub fn tls_listeners_in(
    env: &dyn Environment,
    unset_env: bool,
    tls_config: Option<Arc<ServerConfig>>,
) -> Result<Vec<Option<Listener>>> {
    let listeners = listeners_in(env, unset_env)?;
    Ok(match tls_config {
        Some(config) => wrap_tls(listeners, config),
        None => listeners,
    })
}

pub(crate) fn adapt(named: Vec<NamedFd>) -> Vec<NamedListener> {
    named
        .into_iter()
        .map(|NamedFd { fd, name }| {
            let label = fd.label().to_string();
            let listener = match Listener::from_fd(fd.into_owned_fd()) {
                Ok(listener) => {
                    debug!(
                        fd = %label,
                        name = %name,
                        network = %listener.network(),
                        "Adopted inherited socket"
                    );
                    Some(listener)
                }
                Err(e) => {
                    debug!(
                        fd = %label,
                        name = %name,
                        error = %e,
                        "Inherited fd is not a usable socket"
                    );
                    None
                }
            };
            NamedListener { listener, name }
        })
        .collect()
}

fn socket_type(fd: RawFd) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value/len describe a valid c_int out-buffer.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn socket_family(fd: RawFd) -> io::Result<libc::c_int> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage is large enough for any socket address.
    let result = unsafe { libc::getsockname(fd, storage.as_mut_ptr().cast(), &mut len) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: zero-initialised, and getsockname filled in at least the family.
    let storage = unsafe { storage.assume_init() };
    Ok(libc::c_int::from(storage.ss_family))
}

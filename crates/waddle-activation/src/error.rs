//! Error types for activation and notification.

use std::env::VarError;
use std::io;

use thiserror::Error;

/// Activation / notification errors.
///
/// "Not running under a supervisor" is never reported through this type;
/// it shows up as an empty result or `Ok(false)`.
#[derive(Debug, Error)]
pub enum Error {
    /// An environment variable is present but unreadable
    #[error("cannot read ${var}: {source}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Underlying error
        #[source]
        source: VarError,
    },

    /// An environment variable holds a value we cannot use
    #[error("invalid ${var}: {value:?}")]
    InvalidVar {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },

    /// Connecting to the notify socket failed
    #[error("failed to connect to notify socket {target}: {source}")]
    Connect {
        /// Socket address as given in `NOTIFY_SOCKET`
        target: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Sending the state datagram failed
    #[error("failed to send notify state: {0}")]
    Send(#[source] io::Error),

    /// Sending the fd datagram failed
    #[error("failed to send file descriptors: {0}")]
    SendFds(#[source] io::Error),

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    /// Create an environment read error.
    pub fn env(var: &'static str, source: VarError) -> Self {
        Self::Env { var, source }
    }

    /// Create an invalid variable error.
    pub fn invalid_var(var: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidVar {
            var,
            value: value.into(),
        }
    }

    /// Create a new TLS configuration error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

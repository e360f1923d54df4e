//! # waddle-activation
//!
//! Socket activation and service notification for Waddle, compatible with
//! systemd's [`sd_listen_fds(3)`] and [`sd_notify(3)`] conventions.
//!
//! ## Overview
//!
//! A supervisor (systemd, or an old Waddle process handing over during a
//! restart) opens the listening sockets, places them at fd 3 onwards and
//! execs the service. This crate:
//! 1. Claims the inherited fds (`LISTEN_FDS` / `LISTEN_PID` / `LISTEN_FDNAMES`)
//! 2. Turns them into typed listeners, optionally wrapping TCP ones in TLS
//! 3. Reports lifecycle state over `NOTIFY_SOCKET`, optionally handing fds
//!    back to the supervisor's fd store via `SCM_RIGHTS`
//!
//! "Not activated" is never an error: without a supervisor every call
//! returns an empty set or `Ok(false)`.
//!
//! ## Environment Variables
//!
//! - `LISTEN_PID` — pid the fds are meant for; must match ours
//! - `LISTEN_FDS` — number of inherited fds (starting at fd 3)
//! - `LISTEN_FDNAMES` — colon-separated names for each inherited fd
//! - `NOTIFY_SOCKET` — notify socket path (`@` prefix for the abstract namespace)
//! - `WATCHDOG_USEC` / `WATCHDOG_PID` — watchdog keep-alive interval
//!
//! Every operation has an `_in` variant taking an explicit [`Environment`],
//! so the logic can be exercised without touching the real process env.
//!
//! ## Example
//!
//! ```ignore
//! use waddle_activation::{listeners, notify, NotifyState};
//!
//! let sockets = listeners(true)?;
//! // ... start serving on `sockets` ...
//! notify(&NotifyState::new().ready().status("serving").to_string())?;
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). Abstract notify addresses are
//! Linux-only.
//!
//! [`sd_listen_fds(3)`]: https://www.freedesktop.org/software/systemd/man/sd_listen_fds.html
//! [`sd_notify(3)`]: https://www.freedesktop.org/software/systemd/man/sd_notify.html

#[cfg(not(unix))]
compile_error!("waddle-activation requires a Unix platform (Linux or macOS)");

mod config;
mod env;
mod error;
mod files;
mod listener;
mod notify;
pub mod scm;
mod tls;
mod watchdog;

pub use config::{ListenConfig, NotifyTarget, WatchdogConfig};
pub use env::{Environment, MemoryEnvironment, ProcessEnvironment, UnsetGuard};
pub use error::{Error, Result};
pub use files::{
    files, files_in, files_with_names, files_with_names_in, InheritedFd, NamedFd,
    LISTEN_FDS_START,
};
pub use listener::{
    listeners, listeners_in, listeners_with_names, listeners_with_names_in, tls_listeners,
    tls_listeners_in, Listener, NamedListener, Network, TokioListener,
};
pub use notify::{notify, notify_in, notify_with_fds, notify_with_fds_in, NotifyState};
pub use tls::{load_server_config, wrap_tls, TlsListener, TokioTlsListener};
pub use watchdog::{watchdog_enabled, watchdog_enabled_in};

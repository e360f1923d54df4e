//! Service notification over `NOTIFY_SOCKET`.
//!
//! Sends `KEY=VALUE` state lines to the supervisor as a single datagram.
//! When fds are handed back (e.g. `FDSTORE=1` before a restart) they follow
//! in a second, zero-length datagram carrying `SCM_RIGHTS`.

use std::fmt;
use std::os::fd::BorrowedFd;

use tracing::{debug, trace};

use crate::config::NotifyTarget;
use crate::env::{Environment, ProcessEnvironment, UnsetGuard, NOTIFY_SOCKET};
use crate::error::{Error, Result};
use crate::scm;

/// Send `state` to the supervisor.
///
/// - `Ok(false)`: notification not supported (`NOTIFY_SOCKET` unset)
/// - `Err(_)`: supported, but connecting or sending failed
/// - `Ok(true)`: the state was sent
///
/// It is common to ignore the result.
pub fn notify(state: &str) -> Result<bool> {
    notify_with_fds(false, state, &[])
}

/// [`notify`] against an explicit environment.
pub fn notify_in(env: &dyn Environment, state: &str) -> Result<bool> {
    notify_with_fds_in(env, false, state, &[])
}

/// Send `state` to the supervisor, then hand over `fds`.
///
/// With `unset_env`, `NOTIFY_SOCKET` is removed before returning on every
/// path, so a later call (or a child process) sees no supervisor.
pub fn notify_with_fds(unset_env: bool, state: &str, fds: &[BorrowedFd<'_>]) -> Result<bool> {
    notify_with_fds_in(&ProcessEnvironment, unset_env, state, fds)
}

/// [`notify_with_fds`] against an explicit environment.
pub fn notify_with_fds_in(
    env: &dyn Environment,
    unset_env: bool,
    state: &str,
    fds: &[BorrowedFd<'_>],
) -> Result<bool> {
    let Some(target) = NotifyTarget::from_env(env) else {
        trace!("NOTIFY_SOCKET not set, skipping notification");
        return Ok(false);
    };
    let _guard = unset_env.then(|| UnsetGuard::new(env, &[NOTIFY_SOCKET]));

    let socket = target.connect().map_err(|source| Error::Connect {
        target: target.to_string(),
        source,
    })?;

    socket.send(state.as_bytes()).map_err(Error::Send)?;

    if fds.is_empty() {
        debug!(socket = %target, state, "Sent notification");
        return Ok(true);
    }

    scm::send_datagram_with_fds(&socket, &[], fds).map_err(Error::SendFds)?;
    debug!(socket = %target, state, fd_count = fds.len(), "Sent notification with fds");
    Ok(true)
}

/// Builder for a notification payload.
///
/// ```
/// use waddle_activation::NotifyState;
///
/// let state = NotifyState::new().ready().status("accepting connections");
/// assert_eq!(state.to_string(), "READY=1\nSTATUS=accepting connections");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyState {
    lines: Vec<String>,
}

impl NotifyState {
    /// Startup finished.
    pub const READY: &'static str = "READY=1";
    /// Reloading configuration; follow with `READY=1` when done.
    pub const RELOADING: &'static str = "RELOADING=1";
    /// Shutting down.
    pub const STOPPING: &'static str = "STOPPING=1";
    /// Watchdog keep-alive.
    pub const WATCHDOG: &'static str = "WATCHDOG=1";
    /// Store the attached fds in the supervisor's fd store.
    pub const FDSTORE: &'static str = "FDSTORE=1";

    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// `READY=1`
    pub fn ready(self) -> Self {
        self.line(Self::READY.to_string())
    }

    /// `RELOADING=1`
    pub fn reloading(self) -> Self {
        self.line(Self::RELOADING.to_string())
    }

    /// `STOPPING=1`
    pub fn stopping(self) -> Self {
        self.line(Self::STOPPING.to_string())
    }

    /// `WATCHDOG=1`
    pub fn watchdog(self) -> Self {
        self.line(Self::WATCHDOG.to_string())
    }

    /// `FDSTORE=1`
    pub fn fdstore(self) -> Self {
        self.line(Self::FDSTORE.to_string())
    }

    /// `STATUS=<text>`. Newlines are replaced with spaces.
    pub fn status(self, text: impl AsRef<str>) -> Self {
        self.set("STATUS", text)
    }

    /// `FDNAME=<name>` for fds sent with `FDSTORE=1`.
    pub fn fd_name(self, name: impl AsRef<str>) -> Self {
        self.set("FDNAME", name)
    }

    /// `MAINPID=<pid>`
    pub fn main_pid(self, pid: u32) -> Self {
        self.set("MAINPID", pid.to_string())
    }

    /// `ERRNO=<errno>`
    pub fn errno(self, errno: i32) -> Self {
        self.set("ERRNO", errno.to_string())
    }

    /// Arbitrary `KEY=VALUE`. Newlines in the value are replaced with spaces.
    pub fn set(self, key: &str, value: impl AsRef<str>) -> Self {
        let value = value.as_ref().replace('\n', " ");
        self.line(format!("{key}={value}"))
    }

    /// Whether no lines have been added.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    fn line(mut self, line: String) -> Self {
        self.lines.push(line);
        self
    }
}

impl fmt::Display for NotifyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines.join("\n"))
    }
}

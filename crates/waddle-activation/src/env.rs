//! Environment access.
//!
//! All activation state lives in environment variables set by the
//! supervisor before exec. Operations read it through [`Environment`] so
//! tests can run against a [`MemoryEnvironment`] instead of mutating the
//! process-wide env (which is shared by every test thread).

use std::collections::HashMap;
use std::env::VarError;
use std::ffi::OsString;
use std::sync::Mutex;

pub(crate) const LISTEN_PID: &str = "LISTEN_PID";
pub(crate) const LISTEN_FDS: &str = "LISTEN_FDS";
pub(crate) const LISTEN_FDNAMES: &str = "LISTEN_FDNAMES";
pub(crate) const NOTIFY_SOCKET: &str = "NOTIFY_SOCKET";
pub(crate) const WATCHDOG_PID: &str = "WATCHDOG_PID";
pub(crate) const WATCHDOG_USEC: &str = "WATCHDOG_USEC";

/// Variables cleared by the fd acquisition calls when asked to unset.
pub(crate) const LISTEN_VARS: &[&str] = &[LISTEN_PID, LISTEN_FDS, LISTEN_FDNAMES];

/// Source of activation state.
pub trait Environment {
    /// Raw value of `key`, if set.
    fn var_os(&self, key: &str) -> Option<OsString>;

    /// Remove `key`. Removing an unset variable is a no-op.
    fn remove_var(&self, key: &str);

    /// Value of `key` as UTF-8.
    fn var(&self, key: &str) -> Result<String, VarError> {
        match self.var_os(key) {
            Some(value) => value.into_string().map_err(VarError::NotUnicode),
            None => Err(VarError::NotPresent),
        }
    }
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn var_os(&self, key: &str) -> Option<OsString> {
        std::env::var_os(key)
    }

    fn remove_var(&self, key: &str) {
        std::env::remove_var(key);
    }
}

/// An in-memory environment, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryEnvironment {
    vars: Mutex<HashMap<String, OsString>>,
}

impl MemoryEnvironment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set_var`](Self::set_var).
    pub fn with(self, key: &str, value: impl Into<OsString>) -> Self {
        self.set_var(key, value);
        self
    }

    /// Set `key` to `value`.
    pub fn set_var(&self, key: &str, value: impl Into<OsString>) {
        self.lock().insert(key.to_string(), value.into());
    }

    /// Whether `key` is currently set.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OsString>> {
        self.vars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Environment for MemoryEnvironment {
    fn var_os(&self, key: &str) -> Option<OsString> {
        self.lock().get(key).cloned()
    }

    fn remove_var(&self, key: &str) {
        self.lock().remove(key);
    }
}

/// Removes a set of variables when dropped.
///
/// Held for the duration of a call so the variables are cleared on every
/// exit path, early returns included.
pub struct UnsetGuard<'a> {
    env: &'a dyn Environment,
    keys: &'a [&'a str],
}

impl<'a> UnsetGuard<'a> {
    /// Arm a guard that clears `keys` from `env` on drop.
    pub fn new(env: &'a dyn Environment, keys: &'a [&'a str]) -> Self {
        Self { env, keys }
    }
}

impl Drop for UnsetGuard<'_> {
    fn drop(&mut self) {
        for key in self.keys {
            self.env.remove_var(key);
        }
    }
}

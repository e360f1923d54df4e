//! Parsed snapshots of the supervisor-provided environment.
//!
//! Each snapshot is read fresh from an [`Environment`] on every call;
//! nothing here is cached at process scope.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

use crate::env::{
    Environment, LISTEN_FDNAMES, LISTEN_FDS, LISTEN_PID, NOTIFY_SOCKET, WATCHDOG_PID,
    WATCHDOG_USEC,
};
use crate::error::{Error, Result};
use crate::files::LISTEN_FDS_START;

/// Socket activation parameters addressed to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenConfig {
    /// Value of `LISTEN_PID`
    pub pid: u32,
    /// Value of `LISTEN_FDS`, always non-zero
    pub fd_count: usize,
}

impl ListenConfig {
    /// Read activation parameters for the current process.
    ///
    /// Returns `None` when the process was not socket-activated: variables
    /// missing or malformed, `LISTEN_PID` naming another process, or a zero
    /// count.
    pub fn from_env(env: &dyn Environment) -> Option<Self> {
        Self::for_pid(env, std::process::id())
    }

    /// Like [`from_env`](Self::from_env) but matching against `pid`.
    pub fn for_pid(env: &dyn Environment, pid: u32) -> Option<Self> {
        let listen_pid: u32 = env.var(LISTEN_PID).ok()?.parse().ok()?;
        if listen_pid != pid {
            return None;
        }

        let fd_count: usize = env.var(LISTEN_FDS).ok()?.parse().ok()?;
        let max = (i32::MAX - LISTEN_FDS_START) as usize;
        if fd_count == 0 || fd_count > max {
            return None;
        }

        Some(Self {
            pid: listen_pid,
            fd_count,
        })
    }

    /// Names from `LISTEN_FDNAMES`, in fd order.
    ///
    /// An unset variable yields no names. A value that is not valid UTF-8
    /// is an error.
    pub fn names(env: &dyn Environment) -> Result<Vec<String>> {
        match env.var(LISTEN_FDNAMES) {
            Ok(names) => Ok(names.split(':').map(str::to_string).collect()),
            Err(std::env::VarError::NotPresent) => Ok(Vec::new()),
            Err(e) => Err(Error::env(LISTEN_FDNAMES, e)),
        }
    }
}

/// Address of the supervisor's notify socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyTarget {
    /// Filesystem socket path
    Path(PathBuf),
    /// Linux abstract namespace name (given as `@name`)
    Abstract(Vec<u8>),
}

impl NotifyTarget {
    /// Read `NOTIFY_SOCKET`. Unset or empty means no supervisor is listening.
    pub fn from_env(env: &dyn Environment) -> Option<Self> {
        env.var_os(NOTIFY_SOCKET).and_then(|value| Self::parse(&value))
    }

    /// Parse a `NOTIFY_SOCKET` value.
    pub fn parse(value: &OsStr) -> Option<Self> {
        let bytes = value.as_bytes();
        match bytes.first() {
            None => None,
            Some(b'@') => Some(Self::Abstract(bytes[1..].to_vec())),
            Some(_) => Some(Self::Path(PathBuf::from(value))),
        }
    }

    /// Open an unbound datagram socket connected to this target.
    pub fn connect(&self) -> io::Result<UnixDatagram> {
        match self {
            Self::Path(path) => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(path)?;
                Ok(socket)
            }
            Self::Abstract(name) => connect_abstract(name),
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &[u8]) -> io::Result<UnixDatagram> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    let socket = UnixDatagram::unbound()?;
    socket.connect_addr(&addr)?;
    Ok(socket)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &[u8]) -> io::Result<UnixDatagram> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix socket addresses are only available on Linux",
    ))
}

impl fmt::Display for NotifyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => write!(f, "@{}", String::from_utf8_lossy(name)),
        }
    }
}

/// Watchdog parameters addressed to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// Interval within which `WATCHDOG=1` must be sent
    pub interval: Duration,
}

impl WatchdogConfig {
    /// Read watchdog parameters for the current process.
    pub fn from_env(env: &dyn Environment) -> Result<Option<Self>> {
        Self::for_pid(env, std::process::id())
    }

    /// Like [`from_env`](Self::from_env) but matching against `pid`.
    ///
    /// `Ok(None)` if `WATCHDOG_USEC` is unset or `WATCHDOG_PID` names
    /// another process. A malformed or non-positive interval is an error.
    pub fn for_pid(env: &dyn Environment, pid: u32) -> Result<Option<Self>> {
        let usec = match env.var(WATCHDOG_USEC) {
            Ok(v) if v.is_empty() => return Ok(None),
            Ok(v) => v,
            Err(std::env::VarError::NotPresent) => return Ok(None),
            Err(e) => return Err(Error::env(WATCHDOG_USEC, e)),
        };
        let interval = match usec.parse::<u64>() {
            Ok(0) | Err(_) => return Err(Error::invalid_var(WATCHDOG_USEC, usec)),
            Ok(us) => Duration::from_micros(us),
        };

        let watchdog_pid = match env.var(WATCHDOG_PID) {
            Ok(v) if v.is_empty() => return Ok(Some(Self { interval })),
            Ok(v) => v,
            Err(std::env::VarError::NotPresent) => return Ok(Some(Self { interval })),
            Err(e) => return Err(Error::env(WATCHDOG_PID, e)),
        };
        let watchdog_pid: u32 = watchdog_pid
            .parse()
            .map_err(|_| Error::invalid_var(WATCHDOG_PID, watchdog_pid.clone()))?;

        if watchdog_pid != pid {
            return Ok(None);
        }
        Ok(Some(Self { interval }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemoryEnvironment;

    #[test]
    fn test_listen_config_matches_pid() {
        let env = MemoryEnvironment::new()
            .with(LISTEN_PID, "4242")
            .with(LISTEN_FDS, "2");

        let config = ListenConfig::for_pid(&env, 4242).unwrap();
        assert_eq!(config.fd_count, 2);
        assert_eq!(config.pid, 4242);
    }

    #[test]
    fn test_listen_config_pid_mismatch() {
        for count in ["0", "1", "3", "garbage"] {
            let env = MemoryEnvironment::new()
                .with(LISTEN_PID, "4242")
                .with(LISTEN_FDS, count);
            assert!(ListenConfig::for_pid(&env, 1).is_none());
        }
    }

    #[test]
    fn test_listen_config_malformed_is_not_activated() {
        let cases: &[(&str, &str)] = &[
            ("abc", "1"),
            ("", "1"),
            ("4242", ""),
            ("4242", "-1"),
            ("4242", "0"),
            ("4242", "two"),
            ("4242", "99999999999"),
        ];
        for (pid, fds) in cases {
            let env = MemoryEnvironment::new()
                .with(LISTEN_PID, *pid)
                .with(LISTEN_FDS, *fds);
            assert!(
                ListenConfig::for_pid(&env, 4242).is_none(),
                "pid={pid:?} fds={fds:?}"
            );
        }

        let env = MemoryEnvironment::new().with(LISTEN_FDS, "1");
        assert!(ListenConfig::for_pid(&env, 4242).is_none());
    }

    #[test]
    fn test_names_split() {
        let env = MemoryEnvironment::new().with(LISTEN_FDNAMES, "http:https::admin");
        assert_eq!(
            ListenConfig::names(&env).unwrap(),
            vec!["http", "https", "", "admin"]
        );

        let env = MemoryEnvironment::new();
        assert!(ListenConfig::names(&env).unwrap().is_empty());
    }

    #[test]
    fn test_names_not_unicode() {
        use std::os::unix::ffi::OsStringExt;

        let env = MemoryEnvironment::new()
            .with(LISTEN_FDNAMES, std::ffi::OsString::from_vec(vec![b'a', 0xff]));
        let err = ListenConfig::names(&env).unwrap_err();
        assert!(matches!(err, Error::Env { var: LISTEN_FDNAMES, .. }));
    }

    #[test]
    fn test_notify_target_parse() {
        assert_eq!(NotifyTarget::parse(OsStr::new("")), None);
        assert_eq!(
            NotifyTarget::parse(OsStr::new("/run/systemd/notify")),
            Some(NotifyTarget::Path(PathBuf::from("/run/systemd/notify")))
        );
        assert_eq!(
            NotifyTarget::parse(OsStr::new("@waddle/notify")),
            Some(NotifyTarget::Abstract(b"waddle/notify".to_vec()))
        );
        assert_eq!(
            NotifyTarget::Abstract(b"waddle".to_vec()).to_string(),
            "@waddle"
        );
    }

    #[test]
    fn test_notify_target_from_env() {
        let env = MemoryEnvironment::new();
        assert!(NotifyTarget::from_env(&env).is_none());

        env.set_var(NOTIFY_SOCKET, "");
        assert!(NotifyTarget::from_env(&env).is_none());

        env.set_var(NOTIFY_SOCKET, "/tmp/notify.sock");
        assert!(matches!(
            NotifyTarget::from_env(&env),
            Some(NotifyTarget::Path(_))
        ));
    }

    #[test]
    fn test_watchdog_config() {
        let env = MemoryEnvironment::new();
        assert_eq!(WatchdogConfig::for_pid(&env, 7).unwrap(), None);

        env.set_var(WATCHDOG_USEC, "30000000");
        assert_eq!(
            WatchdogConfig::for_pid(&env, 7).unwrap(),
            Some(WatchdogConfig {
                interval: Duration::from_secs(30)
            })
        );

        env.set_var(WATCHDOG_PID, "7");
        assert!(WatchdogConfig::for_pid(&env, 7).unwrap().is_some());

        env.set_var(WATCHDOG_PID, "8");
        assert_eq!(WatchdogConfig::for_pid(&env, 7).unwrap(), None);
    }

    #[test]
    fn test_watchdog_config_invalid() {
        for usec in ["0", "-5", "soon"] {
            let env = MemoryEnvironment::new().with(WATCHDOG_USEC, usec);
            assert!(matches!(
                WatchdogConfig::for_pid(&env, 7),
                Err(Error::InvalidVar { var: WATCHDOG_USEC, .. })
            ));
        }

        let env = MemoryEnvironment::new()
            .with(WATCHDOG_USEC, "1000")
            .with(WATCHDOG_PID, "me");
        assert!(matches!(
            WatchdogConfig::for_pid(&env, 7),
            Err(Error::InvalidVar { var: WATCHDOG_PID, .. })
        ));
    }
}

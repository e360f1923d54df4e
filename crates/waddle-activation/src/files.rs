//! Inherited file descriptor acquisition.
//!
//! Claims the fds a supervisor placed at `3..3+LISTEN_FDS` before exec
//! (systemd socket activation / fd store, or a Waddle restart handover).

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use tracing::{debug, trace, warn};

use crate::config::ListenConfig;
use crate::env::{Environment, ProcessEnvironment, UnsetGuard, LISTEN_VARS};
use crate::error::Result;

/// First inherited fd, right after stdin/stdout/stderr.
pub const LISTEN_FDS_START: RawFd = 3;

/// A file descriptor inherited from the supervisor.
///
/// Owns the fd; it is closed when this value (or whatever it is converted
/// into) is dropped.
#[derive(Debug)]
pub struct InheritedFd {
    fd: OwnedFd,
    label: String,
}

impl InheritedFd {
    /// Wrap an owned fd, labelling it `LISTEN_FD_<n>`.
    pub fn new(fd: OwnedFd) -> Self {
        let label = format!("LISTEN_FD_{}", fd.as_raw_fd());
        Self { fd, label }
    }

    /// Diagnostic label, e.g. `LISTEN_FD_3`.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Give up the wrapper and keep the fd.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.fd
    }

    /// Convert into a [`File`].
    pub fn into_file(self) -> File {
        File::from(self.fd)
    }
}

impl AsFd for InheritedFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for InheritedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl From<InheritedFd> for OwnedFd {
    fn from(fd: InheritedFd) -> Self {
        fd.fd
    }
}

/// An inherited fd together with the name the supervisor gave it.
#[derive(Debug)]
pub struct NamedFd {
    /// The descriptor
    pub fd: InheritedFd,
    /// Name from `LISTEN_FDNAMES`, empty if none was given
    pub name: String,
}

/// Claim the fds passed to this process.
///
/// Returns an empty vector when the process was not socket-activated.
/// Every returned fd is marked close-on-exec. With `unset_env`, the
/// `LISTEN_*` variables are removed whether or not any fds were found.
pub fn files(unset_env: bool) -> Vec<InheritedFd> {
    files_in(&ProcessEnvironment, unset_env)
}

/// [`files`] against an explicit environment.
pub fn files_in(env: &dyn Environment, unset_env: bool) -> Vec<InheritedFd> {
    let _guard = unset_env.then(|| UnsetGuard::new(env, LISTEN_VARS));

    let Some(config) = ListenConfig::from_env(env) else {
        trace!("No inherited fds: process was not socket-activated");
        return Vec::new();
    };

    let files = claim(config.fd_count);
    debug!(count = files.len(), "Claimed inherited fds");
    files
}

/// Claim the fds passed to this process along with their names.
///
/// Names are matched to fds by position. Missing names are empty and
/// surplus names are ignored. Fails only if `LISTEN_FDNAMES` is set but is
/// not valid UTF-8. The fds are claimed (and marked close-on-exec) before
/// the names are read, so on that error they are closed rather than left
/// for child processes to inherit.
pub fn files_with_names(unset_env: bool) -> Result<Vec<NamedFd>> {
    files_with_names_in(&ProcessEnvironment, unset_env)
}

/// [`files_with_names`] against an explicit environment.
pub fn files_with_names_in(env: &dyn Environment, unset_env: bool) -> Result<Vec<NamedFd>> {
    let _guard = unset_env.then(|| UnsetGuard::new(env, LISTEN_VARS));

    // The guard above owns clearing; the inner call must not clear too.
    let files = files_in(env, false);
    if files.is_empty() {
        return Ok(Vec::new());
    }
    let names = ListenConfig::names(env)?;
    Ok(name_fds(files, names))
}

pub(crate) fn name_fds(files: Vec<InheritedFd>, names: Vec<String>) -> Vec<NamedFd> {
    let mut names = names.into_iter();
    files
        .into_iter()
        .map(|fd| NamedFd {
            fd,
            name: names.next().unwrap_or_default(),
        })
        .collect()
}

fn claim(count: usize) -> Vec<InheritedFd> {
    // Bounded by ListenConfig: 3 + count never exceeds i32::MAX.
    let range = LISTEN_FDS_START..LISTEN_FDS_START + count as RawFd;

    // Take nothing unless the whole range is open. Owning a closed fd
    // number would later close whatever file reused it.
    if let Some(fd) = range.clone().find(|&fd| !is_open(fd)) {
        warn!(fd, count, "LISTEN_FDS names an fd that is not open, ignoring inherited fds");
        return Vec::new();
    }

    range
        .map(|fd| {
            if let Err(e) = set_cloexec(fd) {
                warn!(fd, error = %e, "Failed to set CLOEXEC on inherited fd");
            }
            // SAFETY: the supervisor transfers ownership of 3..3+LISTEN_FDS
            // to this process at exec time, and LISTEN_PID confirmed the
            // transfer is addressed to us.
            InheritedFd::new(unsafe { OwnedFd::from_raw_fd(fd) })
        })
        .collect()
}

fn is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

/// Mark `fd` close-on-exec so children we spawn don't inherit it.
pub(crate) fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if flags & libc::FD_CLOEXEC != 0 {
        return Ok(());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{MemoryEnvironment, LISTEN_FDNAMES, LISTEN_FDS, LISTEN_PID};

    fn other_pid() -> String {
        std::process::id().wrapping_add(1).to_string()
    }

    fn temp_fd() -> InheritedFd {
        let file = tempfile::tempfile().unwrap();
        InheritedFd::new(OwnedFd::from(file))
    }

    /// Cold start: nothing set → no fds.
    #[test]
    fn test_cold_start_returns_empty() {
        let env = MemoryEnvironment::new();
        assert!(files_in(&env, false).is_empty());
        assert!(files_with_names_in(&env, false).unwrap().is_empty());
    }

    /// LISTEN_PID naming another process → no fds, regardless of count.
    #[test]
    fn test_pid_mismatch_returns_empty() {
        for count in ["1", "3", "not-a-number"] {
            let env = MemoryEnvironment::new()
                .with(LISTEN_PID, other_pid())
                .with(LISTEN_FDS, count);
            assert!(files_in(&env, false).is_empty());
        }
    }

    #[test]
    fn test_unset_env_clears_even_when_not_activated() {
        let env = MemoryEnvironment::new()
            .with(LISTEN_PID, other_pid())
            .with(LISTEN_FDS, "2")
            .with(LISTEN_FDNAMES, "a:b");

        assert!(files_in(&env, true).is_empty());
        assert!(!env.contains(LISTEN_PID));
        assert!(!env.contains(LISTEN_FDS));
        assert!(!env.contains(LISTEN_FDNAMES));
    }

    #[test]
    fn test_unset_env_off_leaves_vars() {
        let env = MemoryEnvironment::new().with(LISTEN_PID, other_pid());
        files_in(&env, false);
        files_with_names_in(&env, false).unwrap();
        assert!(env.contains(LISTEN_PID));
    }

    #[test]
    fn test_named_unset_env_clears() {
        let env = MemoryEnvironment::new()
            .with(LISTEN_PID, other_pid())
            .with(LISTEN_FDNAMES, "http");
        assert!(files_with_names_in(&env, true).unwrap().is_empty());
        assert!(!env.contains(LISTEN_PID));
        assert!(!env.contains(LISTEN_FDNAMES));
    }

    /// A count reaching past any fd this process can hold claims nothing,
    /// instead of handing out `OwnedFd`s for closed fd numbers.
    #[test]
    fn test_overstated_count_claims_nothing() {
        let count = (i32::MAX - LISTEN_FDS_START).to_string();
        let env = MemoryEnvironment::new()
            .with(LISTEN_PID, std::process::id().to_string())
            .with(LISTEN_FDS, count)
            .with(LISTEN_FDNAMES, "http");

        assert!(files_in(&env, false).is_empty());
        assert!(files_with_names_in(&env, true).unwrap().is_empty());
        assert!(!env.contains(LISTEN_FDS));
    }

    #[test]
    fn test_is_open() {
        let file = tempfile::tempfile().unwrap();
        assert!(is_open(file.as_raw_fd()));
        assert!(!is_open(-1));
    }

    /// count = 3, names "a:b" → ["a", "b", ""].
    #[test]
    fn test_name_zipping_short_list() {
        let files = vec![temp_fd(), temp_fd(), temp_fd()];
        let named = name_fds(files, vec!["a".into(), "b".into()]);
        let names: Vec<&str> = named.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", ""]);
    }

    #[test]
    fn test_name_zipping_surplus_names_ignored() {
        let files = vec![temp_fd()];
        let named = name_fds(files, vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].name, "a");
    }

    #[test]
    fn test_label_uses_fd_number() {
        let fd = temp_fd();
        assert_eq!(fd.label(), format!("LISTEN_FD_{}", fd.as_raw_fd()));
    }

    #[test]
    fn test_set_cloexec() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };

        set_cloexec(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        // Already set: still fine
        set_cloexec(fd).unwrap();

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_set_cloexec_invalid_fd() {
        assert!(set_cloexec(-1).is_err());
    }
}

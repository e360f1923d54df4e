//! Supervisor watchdog detection.

use std::time::Duration;

use tracing::debug;

use crate::config::WatchdogConfig;
use crate::env::{Environment, ProcessEnvironment, UnsetGuard, WATCHDOG_PID, WATCHDOG_USEC};
use crate::error::Result;

/// Interval within which the service must send `WATCHDOG=1`, if the
/// supervisor expects keep-alives from this process.
///
/// Ping at roughly half the returned interval. With `unset_env`, the
/// `WATCHDOG_*` variables are removed on every path.
pub fn watchdog_enabled(unset_env: bool) -> Result<Option<Duration>> {
    watchdog_enabled_in(&ProcessEnvironment, unset_env)
}

/// [`watchdog_enabled`] against an explicit environment.
pub fn watchdog_enabled_in(env: &dyn Environment, unset_env: bool) -> Result<Option<Duration>> {
    let _guard = unset_env.then(|| UnsetGuard::new(env, &[WATCHDOG_USEC, WATCHDOG_PID]));

    let interval = WatchdogConfig::from_env(env)?.map(|config| config.interval);
    if let Some(interval) = interval {
        debug!(interval_ms = interval.as_millis() as u64, "Supervisor watchdog enabled");
    }
    Ok(interval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MemoryEnvironment;

    #[test]
    fn test_disabled_without_env() {
        let env = MemoryEnvironment::new();
        assert_eq!(watchdog_enabled_in(&env, false).unwrap(), None);
    }

    #[test]
    fn test_enabled_for_this_process() {
        let env = MemoryEnvironment::new()
            .with(WATCHDOG_USEC, "2000000")
            .with(WATCHDOG_PID, std::process::id().to_string());
        assert_eq!(
            watchdog_enabled_in(&env, false).unwrap(),
            Some(Duration::from_secs(2))
        );
        assert!(env.contains(WATCHDOG_USEC));
    }

    #[test]
    fn test_unset_env_clears_on_error() {
        let env = MemoryEnvironment::new()
            .with(WATCHDOG_USEC, "-1")
            .with(WATCHDOG_PID, "1");
        assert!(watchdog_enabled_in(&env, true).is_err());
        assert!(!env.contains(WATCHDOG_USEC));
        assert!(!env.contains(WATCHDOG_PID));
    }
}

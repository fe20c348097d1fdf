use chrono::Duration;

use crate::collaboration::{
    validate_lock_ttl, DEFAULT_CONFLICT_WINDOW_SECS, DEFAULT_LOCK_RENEW_INTERVAL_SECS,
    DEFAULT_LOCK_TTL_SECS, DEFAULT_PRESENCE_HEARTBEAT_SECS, DEFAULT_PRESENCE_TIMEOUT_SECS,
};
use crate::error::CoreError;

/// Timing knobs for a collaboration session.
///
/// | Env Var                    | Default |
/// |----------------------------|---------|
/// | `LOCK_TTL_SECS`            | `30`    |
/// | `LOCK_RENEW_INTERVAL_SECS` | `10`    |
/// | `PRESENCE_HEARTBEAT_SECS`  | `10`    |
/// | `PRESENCE_TIMEOUT_SECS`    | `30`    |
/// | `CONFLICT_WINDOW_SECS`     | `5`     |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollabSettings {
    pub lock_ttl: Duration,
    pub lock_renew_interval: Duration,
    pub heartbeat_interval: Duration,
    pub presence_timeout: Duration,
    pub conflict_window: Duration,
}

impl Default for CollabSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::seconds(DEFAULT_LOCK_TTL_SECS),
            lock_renew_interval: Duration::seconds(DEFAULT_LOCK_RENEW_INTERVAL_SECS),
            heartbeat_interval: Duration::seconds(DEFAULT_PRESENCE_HEARTBEAT_SECS),
            presence_timeout: Duration::seconds(DEFAULT_PRESENCE_TIMEOUT_SECS),
            conflict_window: Duration::seconds(DEFAULT_CONFLICT_WINDOW_SECS),
        }
    }
}

impl CollabSettings {
    /// Load settings from environment variables, falling back to defaults
    /// for anything unset, then validate the combination.
    pub fn from_env() -> Result<Self, CoreError> {
        let defaults = Self::default();
        let settings = Self {
            lock_ttl: secs_from_env("LOCK_TTL_SECS", defaults.lock_ttl)?,
            lock_renew_interval: secs_from_env(
                "LOCK_RENEW_INTERVAL_SECS",
                defaults.lock_renew_interval,
            )?,
            heartbeat_interval: secs_from_env(
                "PRESENCE_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            )?,
            presence_timeout: secs_from_env("PRESENCE_TIMEOUT_SECS", defaults.presence_timeout)?,
            conflict_window: secs_from_env("CONFLICT_WINDOW_SECS", defaults.conflict_window)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// A renewal or heartbeat that arrives after the thing it keeps alive has
    /// already lapsed is useless, so both intervals must be shorter.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_lock_ttl(self.lock_ttl.num_seconds())?;
        if self.lock_renew_interval <= Duration::zero() || self.lock_renew_interval >= self.lock_ttl
        {
            return Err(CoreError::Validation(format!(
                "LOCK_RENEW_INTERVAL_SECS ({}) must be positive and below LOCK_TTL_SECS ({})",
                self.lock_renew_interval.num_seconds(),
                self.lock_ttl.num_seconds()
            )));
        }
        if self.heartbeat_interval <= Duration::zero()
            || self.heartbeat_interval >= self.presence_timeout
        {
            return Err(CoreError::Validation(format!(
                "PRESENCE_HEARTBEAT_SECS ({}) must be positive and below PRESENCE_TIMEOUT_SECS ({})",
                self.heartbeat_interval.num_seconds(),
                self.presence_timeout.num_seconds()
            )));
        }
        if self.conflict_window <= Duration::zero() {
            return Err(CoreError::Validation(
                "CONFLICT_WINDOW_SECS must be positive".into(),
            ));
        }
        Ok(())
    }

    /// How long an open editor counts as active after its last refresh.
    /// Refreshes ride on the heartbeat, so the window is widened by one
    /// heartbeat interval.
    pub fn intent_window(&self) -> Duration {
        self.conflict_window + self.heartbeat_interval
    }

    /// The reconciliation tick runs at the faster of the two intervals.
    pub fn tick_interval(&self) -> std::time::Duration {
        let tick = self.heartbeat_interval.min(self.lock_renew_interval);
        tick.to_std().unwrap_or(std::time::Duration::from_secs(1))
    }
}

fn secs_from_env(var: &str, default: Duration) -> Result<Duration, CoreError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Duration::seconds)
            .map_err(|_| CoreError::Validation(format!("{var} must be an integer, got '{raw}'"))),
        Err(_) => Ok(default),
    }
}

use std::time::Duration;

use derive_builder::Builder;
use derive_getters::Getters;

use crate::engine::Backoff;

/// Tuning shared by the delete engine and the backup pipeline. Built once and
/// never changed while a run is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Getters)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct EngineConfig {
    /// Messages marked per session.
    batch_size: u32,
    /// The run fails once this many failures happen in a row.
    max_consecutive_failures: u32,
    /// Marking stops early after more than this many mark errors in a batch.
    max_mark_errors: u32,
    /// The backup aborts after this many failed fetches in a row.
    max_fetch_failures: u32,
    #[getter(skip)]
    connect_backoff: Backoff,
    #[getter(skip)]
    commit_backoff: Backoff,
    #[getter(skip)]
    delete_pause: Duration,
    #[getter(skip)]
    backup_pause: Duration,
}

impl EngineConfig {
    pub fn connect_backoff(&self) -> Backoff {
        self.connect_backoff
    }

    pub fn commit_backoff(&self) -> Backoff {
        self.commit_backoff
    }

    /// Pause after each committed delete batch.
    pub fn delete_pause(&self) -> Duration {
        self.delete_pause
    }

    /// Pause after each archived backup batch.
    pub fn backup_pause(&self) -> Duration {
        self.backup_pause
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_consecutive_failures: 5,
            max_mark_errors: 10,
            max_fetch_failures: 5,
            connect_backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(120)),
            commit_backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(300)),
            delete_pause: Duration::from_secs(3),
            backup_pause: Duration::from_secs(2),
        }
    }
}

impl EngineConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.batch_size == Some(0) {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.max_consecutive_failures == Some(0) {
            return Err("max_consecutive_failures must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
impl EngineConfig {
    /// Default limits without any waiting.
    pub fn without_waits(batch_size: u32) -> Self {
        Self {
            batch_size,
            connect_backoff: Backoff::none(),
            commit_backoff: Backoff::none(),
            delete_pause: Duration::ZERO,
            backup_pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

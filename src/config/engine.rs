use std::time::Duration;

use serde::Deserialize;

use crate::{
    config::ConfigError,
    engine::{EngineConfig, EngineConfigBuilder},
};

/// Optional overrides of the engine defaults.
#[derive(Debug, Default, Deserialize)]
pub struct EngineSection {
    batch_size: Option<u32>,
    max_consecutive_failures: Option<u32>,
    max_fetch_failures: Option<u32>,
    delete_pause_secs: Option<u64>,
    backup_pause_secs: Option<u64>,
}

impl EngineSection {
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let mut builder = EngineConfigBuilder::default();
        if let Some(batch_size) = self.batch_size {
            builder.batch_size(batch_size);
        }
        if let Some(failures) = self.max_consecutive_failures {
            builder.max_consecutive_failures(failures);
        }
        if let Some(failures) = self.max_fetch_failures {
            builder.max_fetch_failures(failures);
        }
        if let Some(secs) = self.delete_pause_secs {
            builder.delete_pause(Duration::from_secs(secs));
        }
        if let Some(secs) = self.backup_pause_secs {
            builder.backup_pause(Duration::from_secs(secs));
        }
        builder
            .build()
            .map_err(|e| ConfigError::Engine(e.to_string()))
    }
}

mod account;
mod auth;
mod cleanup;
mod engine;

use std::{
    env, io,
    path::{Path, PathBuf},
};

use derive_getters::Getters;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

pub use account::AccountConfig;
pub use account::Provider;
pub use auth::AuthConfig;
pub use cleanup::CleanupConfig;
pub use engine::EngineSection;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("neither XDG_CONFIG_HOME nor HOME is set, pass --config")]
    NoLocation,
    #[error("cannot read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("password_cmd failed: {0}")]
    PasswordCmd(String),
    #[error("invalid [cleanup] setting: {0}")]
    Cleanup(String),
    #[error("invalid [engine] setting: {0}")]
    Engine(String),
}

#[derive(Debug, Deserialize, Getters)]
pub struct Config {
    account: AccountConfig,
    #[serde(default)]
    cleanup: CleanupConfig,
    #[serde(default)]
    engine: EngineSection,
}

impl Config {
    pub fn load_from_file(file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match file {
            Some(path) => path,
            None => default_location()?,
        };
        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        warn_if_readable_by_others(&path);
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

fn default_location() -> Result<PathBuf, ConfigError> {
    let mut config_dir = if let Some(config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config_home)
    } else {
        let mut config_home = PathBuf::from(env::var_os("HOME").ok_or(ConfigError::NoLocation)?);
        config_home.push(".config");
        config_home
    };
    config_dir.push(env!("CARGO_PKG_NAME"));
    config_dir.push("config.toml");

    Ok(config_dir)
}

fn warn_if_readable_by_others(path: &Path) {
    if let Ok(stat) = rustix::fs::stat(path) {
        if stat.st_mode & 0o077 != 0 {
            warn!(
                "{} holds credentials but is accessible by group or others, consider chmod 600",
                path.display()
            );
        }
    }
}

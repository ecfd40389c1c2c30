use std::process::Command;

use derive_getters::Getters;
use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Deserialize, Getters)]
pub struct PlainAuthConfig {
    user: String,
    #[getter(skip)]
    password_cmd: String,
}

impl PlainAuthConfig {
    pub fn password(&self) -> Result<String, ConfigError> {
        let mut cmd_parts = self.password_cmd.split(' ');
        let program = cmd_parts
            .next()
            .filter(|program| !program.is_empty())
            .ok_or_else(|| ConfigError::PasswordCmd("no program given".to_string()))?;
        let mut cmd = Command::new(program);
        for part in cmd_parts {
            cmd.arg(part);
        }
        let output = cmd
            .output()
            .map_err(|e| ConfigError::PasswordCmd(format!("cannot run {program}: {e}")))?;
        if !output.status.success() || output.stdout.is_empty() {
            return Err(ConfigError::PasswordCmd(format!(
                "{program} returned no password"
            )));
        }

        String::from_utf8(output.stdout)
            .map(|password| password.trim_end().to_string())
            .map_err(|_| ConfigError::PasswordCmd(format!("{program} returned invalid UTF-8")))
    }
}

#[derive(Debug, Deserialize, Getters)]
pub struct AppPasswordConfig {
    user: String,
    #[getter(skip)]
    password: String,
}

impl AppPasswordConfig {
    /// App passwords are displayed in groups; the groups are not part of it.
    pub fn password(&self) -> String {
        self.password.chars().filter(|c| !c.is_whitespace()).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum AuthConfig {
    Plain(PlainAuthConfig),
    AppPassword(AppPasswordConfig),
}

impl AuthConfig {
    pub fn user(&self) -> &str {
        match self {
            Self::Plain(plain) => plain.user(),
            Self::AppPassword(app) => app.user(),
        }
    }

    pub fn secret(&self) -> Result<String, ConfigError> {
        match self {
            Self::Plain(plain) => plain.password(),
            Self::AppPassword(app) => Ok(app.password()),
        }
    }
}

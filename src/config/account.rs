use std::time::Duration;

use derive_getters::Getters;
use serde::Deserialize;

use crate::config::auth::AuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Pop3,
    Imap,
}

impl Provider {
    fn default_port(self) -> u16 {
        match self {
            Self::Pop3 => 995,
            Self::Imap => 993,
        }
    }
}

#[derive(Debug, Deserialize, Getters)]
pub struct AccountConfig {
    #[getter(skip)]
    provider: Provider,
    host: String,
    #[getter(skip)]
    port: Option<u16>,
    /// Only used by IMAP.
    #[serde(default = "inbox")]
    mailbox: String,
    #[getter(skip)]
    #[serde(default = "timeout_secs")]
    timeout_secs: u64,
    auth: AuthConfig,
}

impl AccountConfig {
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.provider.default_port())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn inbox() -> String {
    "INBOX".to_string()
}

fn timeout_secs() -> u64 {
    60
}

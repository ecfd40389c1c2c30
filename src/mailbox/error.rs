use std::io;

use thiserror::Error;

/// Failure of one mailbox session operation.
///
/// The variant decides what the batch engines do next: `Connect` and
/// `Transaction` back off and retry, `Auth` ends the run, `Protocol` skips the
/// single message it happened on.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// The commit was refused or its outcome is unknown. No deletion of the
    /// session was applied.
    #[error("commit failed, no deletions applied: {0}")]
    Transaction(String),
    #[error("server rejected command: {0}")]
    Protocol(String),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<io::Error> for SessionError {
    fn from(value: io::Error) -> Self {
        Self::Connect(value.to_string())
    }
}

mod date;
mod error;
#[cfg(test)]
pub mod mock;
mod position;

use bytes::Bytes;
use jiff::civil::DateTime;
use log::trace;

pub use date::message_date;
pub use error::SessionError;
pub use position::SequencePosition;

/// One authenticate-act-commit cycle against a remote mailbox.
///
/// Marks are held by the server until [`MailSession::commit`]. A session
/// that is closed or dropped applies nothing. A commit that fails may still
/// have been applied when only its reply got lost, so callers judge by the
/// count of a later session.
pub trait MailSession {
    async fn count(&mut self) -> Result<u32, SessionError>;

    async fn peek_header(&mut self, position: SequencePosition) -> Result<Bytes, SessionError>;

    async fn fetch_full(&mut self, position: SequencePosition) -> Result<Bytes, SessionError>;

    async fn mark_deleted(&mut self, position: SequencePosition) -> Result<(), SessionError>;

    async fn commit(self) -> Result<(), SessionError>;

    /// Ends the session and discards all marks.
    async fn close(self);

    /// Date of the message at `position`, `None` when it has no usable Date
    /// header. Transport failures are still errors.
    async fn message_date(
        &mut self,
        position: SequencePosition,
    ) -> Result<Option<DateTime>, SessionError> {
        match self.peek_header(position).await {
            Ok(header) => match message_date(&header) {
                Ok(date) => Ok(Some(date)),
                Err(e) => {
                    trace!("#{position}: {e}");
                    Ok(None)
                }
            },
            Err(SessionError::Protocol(e)) => {
                trace!("#{position}: header not retrievable: {e}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Source of fresh sessions. Every batch opens its own session because the
/// remote side may silently drop idle or oversized ones.
pub trait MailboxAccess {
    type Session: MailSession;

    async fn open(&self) -> Result<Self::Session, SessionError>;
}

/// Opens a throwaway session only to read the current message count.
pub async fn observe_count<A: MailboxAccess>(access: &A) -> Result<u32, SessionError> {
    let mut session = access.open().await?;
    let count = session.count().await;
    session.close().await;
    count
}

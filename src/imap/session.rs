use std::{cell::RefCell, rc::Rc, time::Duration};

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{
    imap::{
        codec::{ImapCodec, ImapResponse, Status},
        sequence_set::SequenceSet,
        tag_generator::TagGenerator,
    },
    mailbox::{MailSession, MailboxAccess, SequencePosition, SessionError},
    transport::{SecureStream, connect_tls, within},
};

/// `\Deleted` flags a broken commit may have left on the server.
#[derive(Debug, Clone, PartialEq)]
struct StaleFlags {
    set: String,
    /// Messages selected when the flags were set.
    exists: u32,
}

pub struct ImapAccess {
    host: String,
    port: u16,
    user: String,
    secret: String,
    mailbox: String,
    timeout: Duration,
    stale_flags: Rc<RefCell<Option<StaleFlags>>>,
}

impl ImapAccess {
    pub fn new(
        host: String,
        port: u16,
        user: String,
        secret: String,
        mailbox: String,
        timeout: Duration,
    ) -> Self {
        Self {
            host,
            port,
            user,
            secret,
            mailbox,
            timeout,
            stale_flags: Rc::default(),
        }
    }
}

impl MailboxAccess for ImapAccess {
    type Session = ImapSession;

    async fn open(&self) -> Result<Self::Session, SessionError> {
        let stream = connect_tls(&self.host, self.port, self.timeout).await?;
        ImapSession::start(stream, self).await
    }
}

#[derive(Debug)]
pub struct ImapSession<T = SecureStream> {
    stream: Framed<T, ImapCodec>,
    tag_generator: TagGenerator,
    timeout: Duration,
    exists: u32,
    body: Option<Bytes>,
    marked: Vec<SequencePosition>,
    stale_flags: Rc<RefCell<Option<StaleFlags>>>,
}

impl<T: AsyncRead + AsyncWrite + Unpin> ImapSession<T> {
    /// Reads the greeting, logs in and selects the mailbox of `access` over
    /// an established stream. Flags left behind by an earlier broken commit
    /// are cleared first.
    pub async fn start(stream: T, access: &ImapAccess) -> Result<Self, SessionError> {
        let mut session = Self {
            stream: Framed::new(stream, ImapCodec::default()),
            tag_generator: TagGenerator::default(),
            timeout: access.timeout,
            exists: 0,
            body: None,
            marked: Vec::new(),
            stale_flags: access.stale_flags.clone(),
        };

        match session.receive().await? {
            ImapResponse::Info(greeting) => trace!("greeting = {greeting:?}"),
            ImapResponse::Bye(e) => return Err(SessionError::Connect(format!("server refused: {e}"))),
            other => trace!("unexpected greeting {other:?}"),
        }

        debug!("LOGIN <user> <password>");
        let command = format!("LOGIN {} {}", quote(&access.user), quote(&access.secret));
        if let (Status::No | Status::Bad, text) = session.command(command).await? {
            return Err(SessionError::Auth(text));
        }

        let command = format!("SELECT {}", quote(&access.mailbox));
        debug!("{command}");
        if let (Status::No | Status::Bad, text) = session.command(command).await? {
            return Err(SessionError::Auth(format!(
                "cannot select {}: {text}",
                access.mailbox
            )));
        }

        session.clear_stale_flags().await?;
        Ok(session)
    }

    async fn clear_stale_flags(&mut self) -> Result<(), SessionError> {
        let Some(stale) = self.stale_flags.borrow_mut().take() else {
            return Ok(());
        };
        if self.exists < stale.exists {
            debug!("mailbox shrank since the broken commit, its flags are gone");
            return Ok(());
        }

        info!("clearing \\Deleted flags left on {} by a broken commit", stale.set);
        let command = format!("STORE {} -FLAGS.SILENT (\\Deleted)", stale.set);
        match self.command(command).await {
            Ok((Status::Ok, _)) => Ok(()),
            Ok((_, text)) => {
                warn!("could not clear flags on {}: {text}", stale.set);
                *self.stale_flags.borrow_mut() = Some(stale);
                Ok(())
            }
            Err(e) => {
                *self.stale_flags.borrow_mut() = Some(stale);
                Err(e)
            }
        }
    }

    fn remember_stale_flags(&self, set: &SequenceSet) {
        *self.stale_flags.borrow_mut() = Some(StaleFlags {
            set: set.to_string(),
            exists: self.exists,
        });
    }

    async fn receive(&mut self) -> Result<ImapResponse, SessionError> {
        match within(self.timeout, self.stream.next()).await? {
            Some(response) => Ok(response?),
            None => Err(SessionError::Connect(
                "server closed the connection".to_string(),
            )),
        }
    }

    /// Sends a tagged command and consumes untagged data until its completion.
    async fn command(&mut self, command: String) -> Result<(Status, String), SessionError> {
        let tag = self.tag_generator.next();
        within(self.timeout, self.stream.send(format!("{tag} {command}"))).await??;

        loop {
            match self.receive().await? {
                ImapResponse::Tagged {
                    tag: done,
                    status,
                    text,
                } if done == tag => {
                    trace!("{tag} {status:?} {text}");
                    return Ok((status, text));
                }
                ImapResponse::Tagged { tag: other, .. } => {
                    warn!("ignoring completion of unknown command {other}");
                }
                ImapResponse::Exists(exists) => self.exists = exists,
                ImapResponse::Expunge(_) => self.exists = self.exists.saturating_sub(1),
                ImapResponse::Body { sequence, data } => {
                    trace!("received {} octets for #{sequence}", data.len());
                    self.body = Some(data);
                }
                ImapResponse::Bye(text) => debug!("server said BYE {text}"),
                ImapResponse::Info(_) | ImapResponse::Continue | ImapResponse::Ignored => {}
            }
        }
    }

    async fn fetch(
        &mut self,
        position: SequencePosition,
        item: &str,
    ) -> Result<Bytes, SessionError> {
        self.body = None;
        let command = format!("FETCH {position} ({item})");
        trace!("{command}");
        match self.command(command).await? {
            (Status::Ok, _) => self
                .body
                .take()
                .ok_or_else(|| SessionError::Protocol(format!("no body returned for #{position}"))),
            (_, text) => Err(SessionError::Protocol(format!("FETCH {position}: {text}"))),
        }
    }

    async fn logout(&mut self) {
        debug!("LOGOUT");
        let _ = self.command("LOGOUT".to_string()).await;
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> MailSession for ImapSession<T> {
    async fn count(&mut self) -> Result<u32, SessionError> {
        Ok(self.exists)
    }

    async fn peek_header(&mut self, position: SequencePosition) -> Result<Bytes, SessionError> {
        self.fetch(position, "BODY.PEEK[HEADER.FIELDS (DATE)]").await
    }

    async fn fetch_full(&mut self, position: SequencePosition) -> Result<Bytes, SessionError> {
        self.fetch(position, "BODY.PEEK[]").await
    }

    // flags are only set inside commit, so a session that never commits
    // leaves no \Deleted flags behind
    async fn mark_deleted(&mut self, position: SequencePosition) -> Result<(), SessionError> {
        if position.get() > self.exists {
            return Err(SessionError::Protocol(format!(
                "#{position} is beyond the {} selected messages",
                self.exists
            )));
        }
        self.marked.push(position);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), SessionError> {
        let set: SequenceSet = self.marked.drain(..).collect();
        if set.is_empty() {
            self.logout().await;
            return Ok(());
        }

        let command = format!("STORE {set} +FLAGS.SILENT (\\Deleted)");
        debug!("{command}");
        match self.command(command).await {
            Ok((Status::Ok, _)) => {}
            Ok((_, text)) => {
                self.logout().await;
                return Err(SessionError::Transaction(text));
            }
            Err(e) => {
                // the flags may or may not have been set
                self.remember_stale_flags(&set);
                return Err(SessionError::Transaction(e.to_string()));
            }
        }

        debug!("EXPUNGE");
        match self.command("EXPUNGE".to_string()).await {
            Ok((Status::Ok, _)) => {
                self.logout().await;
                Ok(())
            }
            Ok((_, text)) => {
                let undone = self
                    .command(format!("STORE {set} -FLAGS.SILENT (\\Deleted)"))
                    .await;
                if !matches!(undone, Ok((Status::Ok, _))) {
                    self.remember_stale_flags(&set);
                }
                self.logout().await;
                Err(SessionError::Transaction(text))
            }
            Err(e) => {
                self.remember_stale_flags(&set);
                Err(SessionError::Transaction(e.to_string()))
            }
        }
    }

    async fn close(mut self) {
        self.logout().await;
    }
}

fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{
    mailbox::{MailSession, MailboxAccess, SequencePosition, SessionError},
    pop3::codec::{Pop3Codec, Reply, Shape, parse_stat},
    transport::{SecureStream, connect_tls, within},
};

pub struct Pop3Access {
    host: String,
    port: u16,
    user: String,
    secret: String,
    timeout: Duration,
}

impl Pop3Access {
    pub fn new(host: String, port: u16, user: String, secret: String, timeout: Duration) -> Self {
        Self {
            host,
            port,
            user,
            secret,
            timeout,
        }
    }
}

impl MailboxAccess for Pop3Access {
    type Session = Pop3Session;

    async fn open(&self) -> Result<Self::Session, SessionError> {
        let stream = connect_tls(&self.host, self.port, self.timeout).await?;
        Pop3Session::start(stream, self).await
    }
}

#[derive(Debug)]
pub struct Pop3Session<T = SecureStream> {
    stream: Framed<T, Pop3Codec>,
    timeout: Duration,
}

impl<T: AsyncRead + AsyncWrite + Unpin> Pop3Session<T> {
    /// Reads the greeting and authenticates as the user of `access` over an
    /// established stream.
    pub async fn start(stream: T, access: &Pop3Access) -> Result<Self, SessionError> {
        let mut session = Self {
            stream: Framed::new(stream, Pop3Codec::default()),
            timeout: access.timeout,
        };

        match session.receive().await? {
            Reply::Ok { text, .. } => trace!("greeting = {text:?}"),
            Reply::Err(e) => return Err(SessionError::Connect(format!("server refused: {e}"))),
        }

        debug!("USER <user>");
        if let Reply::Err(e) = session.send(&format!("USER {}", access.user), Shape::Line).await? {
            return Err(SessionError::Auth(e));
        }
        debug!("PASS <password>");
        if let Reply::Err(e) = session.send(&format!("PASS {}", access.secret), Shape::Line).await? {
            return Err(SessionError::Auth(e));
        }

        Ok(session)
    }

    async fn send(&mut self, command: &str, shape: Shape) -> Result<Reply, SessionError> {
        self.stream.codec_mut().expect(shape);
        within(self.timeout, self.stream.send(command)).await??;
        self.receive().await
    }

    async fn receive(&mut self) -> Result<Reply, SessionError> {
        match within(self.timeout, self.stream.next()).await? {
            Some(reply) => Ok(reply?),
            None => Err(SessionError::Connect(
                "server closed the connection".to_string(),
            )),
        }
    }

    async fn multi_line(&mut self, command: &str) -> Result<Bytes, SessionError> {
        trace!("{command}");
        match self.send(command, Shape::MultiLine).await? {
            Reply::Ok { body, .. } => Ok(body.unwrap_or_default()),
            Reply::Err(e) => Err(SessionError::Protocol(format!("{command}: {e}"))),
        }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> MailSession for Pop3Session<T> {
    async fn count(&mut self) -> Result<u32, SessionError> {
        match self.send("STAT", Shape::Line).await? {
            Reply::Ok { text, .. } => parse_stat(&text)
                .map(|(count, size)| {
                    debug!("STAT {count} messages, {size} octets");
                    count
                })
                .ok_or_else(|| SessionError::Protocol(format!("unexpected STAT reply {text:?}"))),
            Reply::Err(e) => Err(SessionError::Protocol(format!("STAT: {e}"))),
        }
    }

    async fn peek_header(&mut self, position: SequencePosition) -> Result<Bytes, SessionError> {
        self.multi_line(&format!("TOP {position} 0")).await
    }

    async fn fetch_full(&mut self, position: SequencePosition) -> Result<Bytes, SessionError> {
        self.multi_line(&format!("RETR {position}")).await
    }

    async fn mark_deleted(&mut self, position: SequencePosition) -> Result<(), SessionError> {
        match self.send(&format!("DELE {position}"), Shape::Line).await? {
            Reply::Ok { .. } => Ok(()),
            Reply::Err(e) => Err(SessionError::Protocol(format!("DELE {position}: {e}"))),
        }
    }

    // QUIT moves the server into its UPDATE state, the only point at which
    // marked messages are removed
    async fn commit(mut self) -> Result<(), SessionError> {
        debug!("QUIT");
        match self.send("QUIT", Shape::Line).await {
            Ok(Reply::Ok { .. }) => Ok(()),
            Ok(Reply::Err(e)) => Err(SessionError::Transaction(e)),
            Err(e) => Err(SessionError::Transaction(e.to_string())),
        }
    }

    async fn close(mut self) {
        debug!("RSET");
        if self.send("RSET", Shape::Line).await.is_ok() {
            let _ = self.send("QUIT", Shape::Line).await;
        }
    }
}

use std::{future::Future, io, time::Duration};

use log::debug;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector, TlsStream, native_tls};

use crate::mailbox::SessionError;

pub type SecureStream = TlsStream<TcpStream>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed server response {0:?}")]
    Malformed(String),
}

// a stream that produced garbage is out of sync and cannot be trusted further
impl From<CodecError> for SessionError {
    fn from(value: CodecError) -> Self {
        Self::Connect(value.to_string())
    }
}

/// Opens a TCP connection and upgrades it to TLS, both within `timeout`.
pub async fn connect_tls(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<SecureStream, SessionError> {
    debug!("connecting to {host}:{port}");
    let tls = native_tls::TlsConnector::new()
        .map_err(|e| SessionError::Connect(format!("tls unavailable: {e}")))?;
    let tls = TlsConnector::from(tls);

    let stream = within(timeout, TcpStream::connect((host, port))).await??;
    within(timeout, tls.connect(host, stream))
        .await?
        .map_err(|e| SessionError::Connect(format!("tls handshake with {host} failed: {e}")))
}

/// Bounds one network round trip. An elapsed timeout counts as a lost
/// connection.
pub async fn within<F: Future>(timeout: Duration, future: F) -> Result<F::Output, SessionError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| SessionError::Connect(format!("timed out after {}s", timeout.as_secs())))
}

#[cfg(test)]
pub mod tests {
    use tokio::{
        io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream, duplex, split},
        task::JoinHandle,
    };

    /// Reply that makes the server close the connection instead of answering.
    pub const HANG_UP: &str = "";

    /// In-memory server that writes `greeting`, then answers each command
    /// line with the next of `replies`. Resolves to the command lines it
    /// received once the client has gone away.
    pub fn scripted_server(
        greeting: &'static str,
        replies: Vec<&'static str>,
    ) -> (DuplexStream, JoinHandle<Vec<String>>) {
        let (client, server) = duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let (read, mut write) = split(server);
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            let mut replies = replies.into_iter();
            let mut open = write.write_all(greeting.as_bytes()).await.is_ok();

            while let Ok(Some(line)) = lines.next_line().await {
                received.push(line);
                match replies.next() {
                    Some(HANG_UP) if open => {
                        let _ = write.shutdown().await;
                        open = false;
                    }
                    Some(reply) if open => {
                        open = write.write_all(reply.as_bytes()).await.is_ok();
                    }
                    _ => {}
                }
            }
            received
        });
        (client, server)
    }
}

// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The inbound message queue that wakes the agent up.
//!
//! Whatever handles the portal's links on the desktop (a URL handler, a browser extension)
//! runs `sigportal-agent open <payload>`, which writes the payload as one line to the agent's
//! Unix socket. The payload is URL-encoded:
//!
//! - `m`: the magic link (required)
//! - `l`: the locale for dialogs and notifications
//! - `t`: when the message expires, in milliseconds since the Unix epoch
//!
//! The payload may be a bare query string or a full URL whose query string holds the fields.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::mpsc,
    task::JoinHandle,
};
use url::Url;

use crate::error::MessageError;

/// Payloads larger than this are refused.
const MAX_MESSAGE: u64 = 64 * 1024;

/// How many messages may wait for the agent before new ones are refused.
const QUEUE_DEPTH: usize = 8;

/// The reply sent when a message is queued.
pub const ACCEPTED: &str = "accepted";

/// The reply sent when the queue is full.
pub const BUSY: &str = "busy";

/// A request to start an exchange with the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicLinkMessage {
    pub magic_link: Url,
    pub locale: Option<String>,
    pub expires_at: Option<SystemTime>,
}

impl MagicLinkMessage {
    /// Whether the message expired before `now`.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl FromStr for MagicLinkMessage {
    type Err = MessageError;

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        let payload = payload.trim();
        let query = payload
            .split_once('?')
            .map_or(payload, |(_, query)| query);

        let mut magic_link = None;
        let mut locale = None;
        let mut expires_at = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "m" => magic_link = Some(Url::parse(&value)?),
                "l" if !value.is_empty() => locale = Some(value.into_owned()),
                "t" if !value.is_empty() => {
                    let millis = value
                        .parse::<u64>()
                        .map_err(|_| MessageError::InvalidExpiry(value.to_string()))?;
                    expires_at = Some(UNIX_EPOCH + Duration::from_millis(millis));
                }
                _ => {}
            }
        }

        Ok(Self {
            magic_link: magic_link.ok_or(MessageError::MissingMagicLink)?,
            locale,
            expires_at,
        })
    }
}

/// Messages received on the agent's socket, waiting to be handled.
#[derive(Debug)]
pub struct MessageQueue {
    receiver: mpsc::Receiver<String>,
    listener: JoinHandle<()>,
    socket_path: PathBuf,
}

impl MessageQueue {
    /// Listen for messages on `socket_path`.
    ///
    /// A stale socket left by an agent that exited uncleanly is replaced. This must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// An error is returned if another agent is listening on the socket, or the socket can't
    /// be created.
    pub fn bind(socket_path: &Path) -> anyhow::Result<Self> {
        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(socket_path).is_ok() {
                anyhow::bail!(
                    "Another agent is already listening on {}",
                    socket_path.display()
                );
            }
            tracing::debug!(socket_path = %socket_path.display(), "Removing stale socket");
            std::fs::remove_file(socket_path)
                .with_context(|| format!("Failed to remove {}", socket_path.display()))?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("Failed to bind to {}", socket_path.display()))?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict {}", socket_path.display()))?;
        tracing::info!(socket_path = %socket_path.display(), "Listening for magic links");

        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let listener = tokio::spawn(accept_loop(listener, sender));
        Ok(Self {
            receiver,
            listener,
            socket_path: socket_path.to_path_buf(),
        })
    }

    /// The next waiting message, if there is one.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.listener.abort();
        if let Err(error) = std::fs::remove_file(&self.socket_path) {
            tracing::warn!(socket_path = %self.socket_path.display(), ?error, "Failed to clean up socket");
        }
    }
}

async fn accept_loop(listener: UnixListener, sender: mpsc::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((connection, _addr)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if let Err(error) = receive(connection, sender).await {
                        tracing::warn!(?error, "Failed to receive message");
                    }
                });
            }
            Err(error) => tracing::warn!(?error, "Unable to accept connection, retrying..."),
        }
    }
}

async fn receive(connection: UnixStream, sender: mpsc::Sender<String>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = connection.into_split();
    let mut line = String::new();
    BufReader::new(read_half.take(MAX_MESSAGE))
        .read_line(&mut line)
        .await?;
    let line = line.trim_end().to_string();
    if line.is_empty() {
        anyhow::bail!("empty message");
    }

    let reply = match sender.try_send(line) {
        Ok(()) => ACCEPTED,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("Message queue is full; refusing message");
            BUSY
        }
        Err(mpsc::error::TrySendError::Closed(_)) => anyhow::bail!("the agent is shutting down"),
    };
    write_half.write_all(format!("{reply}\n").as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Hand `payload` to the agent listening on `socket_path`.
///
/// # Errors
///
/// An error is returned if no agent is listening, or the agent refuses the message.
pub async fn send_message(socket_path: &Path, payload: &str) -> anyhow::Result<()> {
    let payload = payload.trim();
    if payload.contains('\n') {
        anyhow::bail!("The message must be a single line");
    }

    let connection = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to socket at {}", socket_path.display()))?;
    let (read_half, mut write_half) = connection.into_split();
    write_half
        .write_all(format!("{payload}\n").as_bytes())
        .await?;
    write_half.shutdown().await?;

    let mut reply = String::new();
    BufReader::new(read_half).read_line(&mut reply).await?;
    match reply.trim() {
        ACCEPTED => Ok(()),
        BUSY => Err(anyhow::anyhow!("The agent is busy; try again later")),
        other => Err(anyhow::anyhow!("Unexpected reply from the agent: '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn parse_full_message() -> Result<()> {
        let message: MagicLinkMessage = "sigportal://open?m=https%3A%2F%2Fauth.example.com%2Frealms%2Fportal%2Fprotocol%2Fopenid-connect%2Fauth%3Fx%3D1&l=de&t=1700000000000".parse()?;
        assert_eq!(
            message.magic_link.as_str(),
            "https://auth.example.com/realms/portal/protocol/openid-connect/auth?x=1"
        );
        assert_eq!(message.locale.as_deref(), Some("de"));
        assert_eq!(
            message.expires_at,
            Some(UNIX_EPOCH + Duration::from_millis(1_700_000_000_000))
        );
        Ok(())
    }

    #[test]
    fn parse_bare_query() -> Result<()> {
        let message: MagicLinkMessage = "m=https%3A%2F%2Fportal.example.com%2Flink".parse()?;
        assert_eq!(message.magic_link.as_str(), "https://portal.example.com/link");
        assert!(message.locale.is_none());
        assert!(!message.is_expired(SystemTime::now()));
        Ok(())
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            "l=en".parse::<MagicLinkMessage>(),
            Err(MessageError::MissingMagicLink)
        ));
        assert!(matches!(
            "m=not%20a%20url".parse::<MagicLinkMessage>(),
            Err(MessageError::InvalidUrl(_))
        ));
        assert!(matches!(
            "m=https%3A%2F%2Fportal.example.com&t=soon".parse::<MagicLinkMessage>(),
            Err(MessageError::InvalidExpiry(_))
        ));
    }

    #[test]
    fn expiry() -> Result<()> {
        let message: MagicLinkMessage = "m=https%3A%2F%2Fportal.example.com&t=1000".parse()?;
        assert!(message.is_expired(UNIX_EPOCH + Duration::from_secs(1)));
        assert!(!message.is_expired(UNIX_EPOCH + Duration::from_millis(999)));
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn messages_arrive_over_socket() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("agent.socket");
        let mut queue = MessageQueue::bind(&socket_path)?;
        assert!(queue.try_recv().is_none());

        send_message(&socket_path, "m=https%3A%2F%2Fportal.example.com\n").await?;
        assert_eq!(
            queue.try_recv().as_deref(),
            Some("m=https%3A%2F%2Fportal.example.com")
        );

        assert!(MessageQueue::bind(&socket_path).is_err());
        drop(queue);
        assert!(!socket_path.exists());
        Ok(())
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("agent.socket");
        drop(std::os::unix::net::UnixListener::bind(&socket_path)?);
        assert!(socket_path.exists());

        let mut queue = MessageQueue::bind(&socket_path)?;
        send_message(&socket_path, "m=https%3A%2F%2Fportal.example.com").await?;
        assert!(queue.try_recv().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn nobody_listening() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = send_message(&dir.path().join("agent.socket"), "m=x").await;
        assert!(result.is_err());
        Ok(())
    }
}

//! Command relay - serialized command dispatch against the worker channel.
//!
//! The worker protocol is partially asymmetric: commands whose text begins
//! with the literal prefix `read` produce exactly one reply line, everything
//! else is fire-and-forget. The relay claims the channel's single reply slot
//! *before* writing a read-type command (a fast reply cannot race the
//! listener) and holds a lock across the claim/write/await so concurrent
//! read-type sends block instead of cross-wiring replies.

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{ChannelError, WorkerChannel};

/// Sentinel acknowledgement returned for write-type commands.
pub const WRITE_ACK: &str = "ok";

const READ_PREFIX: &str = "read";

/// One command line for the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    expects_reply: bool,
}

impl Command {
    /// Classify by protocol prefix: `read ...` expects a reply line.
    pub fn classify(text: impl Into<String>) -> Self {
        let text = text.into();
        let expects_reply = text.starts_with(READ_PREFIX);
        Self {
            text,
            expects_reply,
        }
    }

    /// A fire-and-forget command.
    pub fn write(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expects_reply: false,
        }
    }

    /// A command that expects exactly one reply line.
    pub fn read(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            expects_reply: true,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The worker process is not running. Device commands are not safe to
    /// retry blindly, so no retry is attempted.
    #[error("worker channel closed")]
    ChannelClosed,
}

impl From<ChannelError> for RelayError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Closed => RelayError::ChannelClosed,
            // Unreachable through the relay: reads are serialized below.
            ChannelError::ReplyPending => {
                tracing::error!("reply slot occupied despite relay serialization");
                RelayError::ChannelClosed
            }
        }
    }
}

/// Seam for issuing commands, so the controller service can be tested with a
/// mock port instead of a live subprocess.
#[async_trait]
pub trait CommandPort: Send + Sync {
    async fn send(&self, cmd: &Command) -> Result<String, RelayError>;
}

/// Relay backed by the single shared [`WorkerChannel`].
pub struct CommandRelay {
    channel: Arc<WorkerChannel>,
    read_gate: tokio::sync::Mutex<()>,
}

impl CommandRelay {
    pub fn new(channel: Arc<WorkerChannel>) -> Self {
        Self {
            channel,
            read_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn channel(&self) -> &Arc<WorkerChannel> {
        &self.channel
    }
}

#[async_trait]
impl CommandPort for CommandRelay {
    async fn send(&self, cmd: &Command) -> Result<String, RelayError> {
        if !cmd.expects_reply() {
            self.channel.write_line(cmd.text()).await?;
            return Ok(WRITE_ACK.to_string());
        }

        // Serialize read-type commands: at most one reply claim exists at any
        // instant, and the claim is registered before the write goes out.
        let _serial = self.read_gate.lock().await;
        let reply = self.channel.claim_reply()?;
        if let Err(e) = self.channel.write_line(cmd.text()).await {
            self.channel.abandon_reply();
            return Err(e.into());
        }
        let line = reply.await.map_err(|_| RelayError::ChannelClosed)?;
        Ok(line.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{ShellSpawner, echo_read_worker, test_journal};
    use std::time::Duration;

    fn start_relay(spawner: &dyn crate::channel::WorkerSpawner) -> (CommandRelay, tempfile::TempDir) {
        let (journal, dir) = test_journal();
        (
            CommandRelay::new(WorkerChannel::start(spawner, journal).unwrap()),
            dir,
        )
    }

    #[test]
    fn classify_read_prefix() {
        assert!(Command::classify("read temp").expects_reply());
        assert!(Command::classify("read adc 0").expects_reply());
        assert!(!Command::classify("led 3 on").expects_reply());
        assert!(!Command::classify("blink 0.5 5").expects_reply());
        assert!(!Command::classify("close").expects_reply());
    }

    #[tokio::test]
    async fn write_type_resolves_immediately_with_ack() {
        let (relay, _dir) = start_relay(&echo_read_worker());

        let ack = relay.send(&Command::write("led 3 on")).await.unwrap();
        assert_eq!(ack, WRITE_ACK);
        relay.channel().shutdown().await;
    }

    #[tokio::test]
    async fn read_type_resolves_with_reply_line() {
        let (relay, _dir) = start_relay(&echo_read_worker());

        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            relay.send(&Command::read("read temp")),
        )
        .await
        .expect("timed out")
        .unwrap();
        assert_eq!(reply, "ok:read temp");
        relay.channel().shutdown().await;
    }

    #[tokio::test]
    async fn write_type_does_not_consume_the_next_reply() {
        // A write-type command followed by a read-type command: the reply
        // belongs to the read, even though the write came first.
        let (relay, _dir) = start_relay(&echo_read_worker());

        relay.send(&Command::write("led 1 on")).await.unwrap();
        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            relay.send(&Command::read("read adc")),
        )
        .await
        .expect("timed out")
        .unwrap();
        assert_eq!(reply, "ok:read adc");
        relay.channel().shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_reads_are_serialized_not_cross_wired() {
        let (relay, _dir) = start_relay(&echo_read_worker());
        let relay = Arc::new(relay);

        let mut handles = Vec::new();
        for i in 0..4 {
            let relay = Arc::clone(&relay);
            handles.push(tokio::spawn(async move {
                relay.send(&Command::read(format!("read ch{i}"))).await
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let reply = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("timed out")
                .unwrap()
                .unwrap();
            // Each caller gets the reply to its own command, whatever the
            // scheduling order.
            assert_eq!(reply, format!("ok:read ch{i}"));
        }
        relay.channel().shutdown().await;
    }

    #[tokio::test]
    async fn send_fails_with_channel_closed_when_worker_gone() {
        let (relay, _dir) = start_relay(&ShellSpawner("exit 0".to_string()));

        // Wait for the exit monitor to observe the death.
        let mut rx = relay.channel().subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *rx.borrow() != crate::channel::ChannelState::Terminated {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            relay.send(&Command::write("led 0 on")).await,
            Err(RelayError::ChannelClosed)
        ));
        assert!(matches!(
            relay.send(&Command::read("read temp")).await,
            Err(RelayError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn outstanding_read_fails_fast_on_worker_exit() {
        // Worker swallows one command and dies without replying.
        let (relay, _dir) = start_relay(&ShellSpawner("read line; exit 0".to_string()));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay.send(&Command::read("read temp")),
        )
        .await
        .expect("read-type send hung after worker exit");
        assert!(matches!(result, Err(RelayError::ChannelClosed)));
    }
}

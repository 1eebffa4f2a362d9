//! Worker channel - owns the GPIO worker subprocess.
//!
//! The worker is spawned once and speaks a newline-delimited UTF-8 protocol
//! on stdin/stdout. stderr is a diagnostic stream: forwarded to logging,
//! never parsed for control decisions.
//!
//! Lifecycle: `Unstarted → Running → Terminating → Terminated`. An explicit
//! stop request walks the full chain; unexpected process exit jumps straight
//! to `Terminated`. Either way the exit monitor drops any pending reply
//! claim, so an outstanding read-type command fails fast instead of hanging.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::journal::Journal;

/// Lifecycle state of the worker subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unstarted,
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The worker process has exited or was never started.
    #[error("worker channel closed")]
    Closed,
    /// A reply claim is already outstanding. The relay serializes read-type
    /// commands, so hitting this indicates a caller bypassed the relay.
    #[error("a reply claim is already outstanding")]
    ReplyPending,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
///
/// Production uses [`ScriptSpawner`]; tests inject shell one-liners.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns the configured worker script with all three streams piped.
pub struct ScriptSpawner {
    program: String,
    args: Vec<String>,
}

impl ScriptSpawner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl WorkerSpawner for ScriptSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(child)
    }
}

fn lock_slot<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    // The slot only holds channel senders; a poisoned guard is still usable.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ReplySlot = Arc<StdMutex<Option<oneshot::Sender<String>>>>;

/// Handle to the single long-lived worker subprocess.
pub struct WorkerChannel {
    writer: tokio::sync::Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    state: Arc<watch::Sender<ChannelState>>,
    pending: ReplySlot,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl WorkerChannel {
    /// Spawn the worker and start its reader and exit-monitor tasks.
    pub fn start(
        spawner: &dyn WorkerSpawner,
        journal: Arc<Journal>,
    ) -> Result<Arc<Self>, SpawnError> {
        let mut child = spawner.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::Other("stderr not captured".to_string()))?;

        let (state_tx, _state_rx) = watch::channel(ChannelState::Unstarted);
        let state = Arc::new(state_tx);
        let pending: ReplySlot = Arc::new(StdMutex::new(None));
        let (kill_tx, mut kill_rx) = oneshot::channel();

        // Stdout reader: every line goes to the journal; the first line after
        // a reply claim is additionally delivered to the claimant.
        let pending_for_reader = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        journal.record(&format!("GPIO: {line}")).await;
                        if let Some(tx) = lock_slot(&pending_for_reader).take() {
                            let _ = tx.send(line);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::error!(target: "gatehouse::worker", error = %e, "worker stdout read error");
                        break;
                    }
                    None => {
                        tracing::debug!(target: "gatehouse::worker", "worker stdout closed");
                        break;
                    }
                }
            }
        });

        // Stderr is logged only. A noisy worker must never fail the channel.
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        tracing::warn!(target: "gatehouse::worker", "worker stderr: {}", line)
                    }
                    Err(e) => {
                        tracing::warn!(target: "gatehouse::worker", error = %e, "worker stderr read error");
                        break;
                    }
                }
            }
        });

        // Exit monitor: owns the child. Sets Terminated and drops the pending
        // reply claim so outstanding reads fail with `Closed` instead of
        // hanging. The kill signal arrives from `shutdown()`; if the channel
        // handle is dropped outright, the select arm fires on the closed
        // sender and the worker is killed as well.
        let state_for_monitor = Arc::clone(&state);
        let pending_for_monitor = Arc::clone(&pending);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(target: "gatehouse::worker", error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    tracing::info!(target: "gatehouse::worker", %status, "worker exited")
                }
                Err(e) => {
                    tracing::warn!(target: "gatehouse::worker", error = %e, "failed to wait for worker")
                }
            }
            state_for_monitor.send_replace(ChannelState::Terminated);
            if lock_slot(&pending_for_monitor).take().is_some() {
                tracing::warn!(
                    target: "gatehouse::worker",
                    "worker exited with a reply claim outstanding; failing the pending read"
                );
            }
        });

        state.send_replace(ChannelState::Running);

        Ok(Arc::new(Self {
            writer: tokio::sync::Mutex::new(FramedWrite::new(stdin, LinesCodec::new())),
            state,
            pending,
            kill_tx: StdMutex::new(Some(kill_tx)),
        }))
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle transitions (used by health reporting).
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Running | ChannelState::Terminating
        )
    }

    /// Write one command line to the worker. Fire-and-forget: no output line
    /// is awaited or consumed.
    pub async fn write_line(&self, text: &str) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(text.to_string()).await.map_err(|e| {
            tracing::warn!(target: "gatehouse::worker", error = %e, "worker stdin write failed");
            ChannelError::Closed
        })
    }

    /// Register the single pending reply claim.
    ///
    /// Must be called before the corresponding write so a fast reply cannot
    /// slip past the claimant. The returned receiver resolves with the first
    /// subsequent output line, or errors if the worker exits first.
    pub fn claim_reply(&self) -> Result<oneshot::Receiver<String>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        let rx = {
            let mut slot = lock_slot(&self.pending);
            if slot.is_some() {
                return Err(ChannelError::ReplyPending);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };
        // Re-check after inserting: if the exit monitor ran in between, it
        // either already dropped our sender or is about to find the slot
        // empty. Either way the claim must not outlive a dead worker.
        if self.state() == ChannelState::Terminated {
            lock_slot(&self.pending).take();
            return Err(ChannelError::Closed);
        }
        Ok(rx)
    }

    /// Drop the pending reply claim, if any (used when the write that was
    /// supposed to trigger the reply never made it out).
    pub fn abandon_reply(&self) {
        lock_slot(&self.pending).take();
    }

    /// Graceful stop: send the `stop`/`exit` sentinels, kill the process, and
    /// wait for `Terminated`. Best-effort and idempotent; never panics.
    pub async fn shutdown(&self) {
        if self.state() == ChannelState::Terminated {
            return;
        }
        self.state.send_replace(ChannelState::Terminating);

        // The worker may already be gone; sentinel writes are best-effort.
        let _ = self.write_line("stop").await;
        let _ = self.write_line("exit").await;

        if let Some(kill) = lock_slot(&self.kill_tx).take() {
            let _ = kill.send(());
        }

        let mut rx = self.state.subscribe();
        while *rx.borrow() != ChannelState::Terminated {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Spawns `sh -c <script>` with all streams piped.
    pub struct ShellSpawner(pub String);

    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self) -> Result<Child, SpawnError> {
            let child = Command::new("sh")
                .args(["-c", &self.0])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            Ok(child)
        }
    }

    /// A worker that replies only to `read`-prefixed commands, like the real
    /// GPIO script's protocol shape.
    pub fn echo_read_worker() -> ShellSpawner {
        ShellSpawner(
            r#"while read line; do
                 case "$line" in
                   read*) echo "ok:$line" ;;
                   exit) exit 0 ;;
                 esac
               done"#
                .to_string(),
        )
    }

    pub fn test_journal() -> (Arc<Journal>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = Arc::new(Journal::new(dir.path().join("journal.log")));
        (journal, dir)
    }
}

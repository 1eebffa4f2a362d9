//! Journal - append-only sink backed by the log device.
//!
//! Every entry is one human-readable line, mirrored to structured logging.
//! Writes are best-effort: a failed append is reported to tracing and never
//! surfaced to the caller.

use std::io;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one entry. Never fails; sink errors go to the diagnostic log.
    pub async fn record(&self, entry: &str) {
        tracing::info!(target: "gatehouse::journal", "{}", entry);

        let line = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), entry);
        if let Err(e) = self.append(line.as_bytes()).await {
            tracing::warn!(
                target: "gatehouse::journal",
                error = %e,
                path = %self.path.display(),
                "failed to append journal entry"
            );
        }
    }

    async fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }

    /// Read the full sink contents back (for the logs endpoint).
    pub async fn read_all(&self) -> io::Result<String> {
        tokio::fs::read_to_string(&self.path).await
    }
}

//! Kernel driver guard - scoped acquisition of the log device module.
//!
//! The module is loaded at startup and unloaded when the guard drops, on
//! every exit path. Load or unload failure is logged and never fatal: the
//! server runs without the log device, the journal degrades to best-effort.

use std::path::Path;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("hardware resource unavailable: {0}")]
    Unavailable(String),
}

/// Holds the loaded kernel module for the process lifetime.
pub struct DriverGuard {
    module_name: Option<String>,
}

impl DriverGuard {
    /// Load the module at `path`, if configured. Failure leaves the guard
    /// empty and the server running.
    pub async fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self { module_name: None };
        };
        match Self::insmod(path).await {
            Ok(name) => {
                tracing::info!(target: "gatehouse::driver", module = %name, "kernel driver loaded");
                Self {
                    module_name: Some(name),
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "gatehouse::driver",
                    error = %e,
                    path = %path.display(),
                    "continuing without kernel log driver"
                );
                Self { module_name: None }
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.module_name.is_some()
    }

    async fn insmod(path: &Path) -> Result<String, DriverError> {
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DriverError::Unavailable("module path has no stem".to_string()))?
            .to_string();

        let status = Command::new("insmod")
            .arg(path)
            .status()
            .await
            .map_err(|e| DriverError::Unavailable(format!("failed to run insmod: {e}")))?;

        if status.success() {
            Ok(name)
        } else {
            Err(DriverError::Unavailable(format!(
                "insmod exited with {status}"
            )))
        }
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        let Some(name) = self.module_name.take() else {
            return;
        };
        // Drop cannot await; a blocking rmmod at process teardown is fine.
        match std::process::Command::new("rmmod").arg(&name).status() {
            Ok(status) if status.success() => {
                tracing::info!(target: "gatehouse::driver", module = %name, "kernel driver unloaded")
            }
            Ok(status) => {
                tracing::warn!(target: "gatehouse::driver", module = %name, %status, "rmmod failed")
            }
            Err(e) => {
                tracing::warn!(target: "gatehouse::driver", module = %name, error = %e, "failed to run rmmod")
            }
        }
    }
}

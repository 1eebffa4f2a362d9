//! Detection runner - spawns the one-shot camera detection subprocess.
//!
//! The subprocess emits zero or more stdout lines, at most one of which is a
//! well-formed `{"result": bool, "adc": number}` object. Malformed output is
//! data noise, not a protocol error: it is ignored and the last successfully
//! parsed object wins. The action's outcome is determined by process exit.

use std::io;
use std::process::Stdio;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};

/// One parsed detection line from the subprocess.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionReading {
    pub result: bool,
    pub adc: f64,
}

/// Outcome of a detection run. `adc` is null when no reading ever parsed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DetectionReport {
    pub success: bool,
    pub adc: Option<f64>,
}

impl DetectionReport {
    fn none() -> Self {
        Self {
            success: false,
            adc: None,
        }
    }
}

/// Spawns the configured detection command and collects its report.
#[derive(Debug, Clone)]
pub struct DetectionRunner {
    program: String,
    args: Vec<String>,
}

impl DetectionRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Run the subprocess to completion.
    ///
    /// Errors only on spawn/wait failure; unparseable output degrades to a
    /// failed report instead.
    pub async fn run(&self) -> io::Result<DetectionReport> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;

        tokio::spawn(async move {
            let mut lines = FramedRead::new(stderr, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                tracing::warn!(target: "gatehouse::detect", "detector stderr: {}", line);
            }
        });

        let reader = tokio::spawn(async move {
            let mut last: Option<DetectionReading> = None;
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                match serde_json::from_str::<DetectionReading>(line.trim()) {
                    Ok(reading) => last = Some(reading),
                    Err(e) => {
                        tracing::debug!(
                            target: "gatehouse::detect",
                            error = %e,
                            line = %line,
                            "ignoring unparseable detector output"
                        );
                    }
                }
            }
            last
        });

        let status = child.wait().await?;
        tracing::debug!(target: "gatehouse::detect", %status, "detector exited");

        let report = match reader.await {
            Ok(Some(reading)) => DetectionReport {
                success: reading.result,
                adc: Some(reading.adc),
            },
            Ok(None) => DetectionReport::none(),
            Err(e) => {
                tracing::error!(target: "gatehouse::detect", error = %e, "detector reader task failed");
                DetectionReport::none()
            }
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> DetectionRunner {
        DetectionRunner::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn well_formed_reading_is_reported() {
        let runner = shell(r#"echo '{"result":true,"adc":512}'"#);
        let report = runner.run().await.unwrap();
        assert_eq!(
            report,
            DetectionReport {
                success: true,
                adc: Some(512.0)
            }
        );
    }

    #[tokio::test]
    async fn malformed_output_reports_failure_with_null_adc() {
        let runner = shell(r#"echo "starting camera"; echo "not json at all""#);
        let report = runner.run().await.unwrap();
        assert_eq!(
            report,
            DetectionReport {
                success: false,
                adc: None
            }
        );
    }

    #[tokio::test]
    async fn last_parsed_reading_wins() {
        let runner = shell(
            r#"echo '{"result":false,"adc":100}'; echo "noise"; echo '{"result":true,"adc":700.5}'"#,
        );
        let report = runner.run().await.unwrap();
        assert_eq!(
            report,
            DetectionReport {
                success: true,
                adc: Some(700.5)
            }
        );
    }

    #[tokio::test]
    async fn negative_result_with_reading() {
        let runner = shell(r#"echo '{"result":false,"adc":42}'"#);
        let report = runner.run().await.unwrap();
        assert_eq!(
            report,
            DetectionReport {
                success: false,
                adc: Some(42.0)
            }
        );
    }

    #[tokio::test]
    async fn stderr_noise_does_not_affect_report() {
        let runner = shell(r#"echo "camera warmup failed" >&2; echo '{"result":true,"adc":3}'"#);
        let report = runner.run().await.unwrap();
        assert!(report.success);
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error() {
        let runner = DetectionRunner::new("/nonexistent/detector", vec![]);
        assert!(runner.run().await.is_err());
    }

    #[tokio::test]
    async fn silent_exit_reports_failure() {
        let runner = shell("exit 0");
        let report = runner.run().await.unwrap();
        assert_eq!(report, DetectionReport::none());
    }
}

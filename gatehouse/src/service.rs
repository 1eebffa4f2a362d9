//! Controller service - composes gate, relay, detector, and journal into the
//! high-level door/LED actions. Transport-agnostic: HTTP handlers delegate
//! here and map [`ActionError`] to status codes.

use std::sync::Arc;

use tokio::sync::watch;

use crate::channel::{ChannelState, WorkerChannel};
use crate::detect::{DetectionReport, DetectionRunner};
use crate::gate::{AuthGate, GateError};
use crate::journal::Journal;
use crate::relay::{Command, CommandPort, RelayError};

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// The worker process is not running; the command was not delivered.
    #[error("worker channel closed")]
    ChannelClosed,
    /// Another action is already awaiting approval.
    #[error("an approval is already pending")]
    GateBusy,
    /// The action was abandoned during shutdown.
    #[error("action aborted")]
    Aborted,
    /// The detection subprocess could not be run.
    #[error("detection failed: {0}")]
    Detection(String),
}

impl From<RelayError> for ActionError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::ChannelClosed => ActionError::ChannelClosed,
        }
    }
}

impl From<GateError> for ActionError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Busy => ActionError::GateBusy,
            GateError::Abandoned => ActionError::Aborted,
        }
    }
}

/// Point-in-time view of controller health for the health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub channel: ChannelState,
    pub approval_pending: bool,
}

pub struct ControllerService {
    port: Arc<dyn CommandPort>,
    channel: Option<Arc<WorkerChannel>>,
    gate: Arc<AuthGate>,
    detector: DetectionRunner,
    journal: Arc<Journal>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControllerService {
    pub fn new(
        port: Arc<dyn CommandPort>,
        detector: DetectionRunner,
        journal: Arc<Journal>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            port,
            channel: None,
            gate: AuthGate::new(),
            detector,
            journal,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Attach the worker channel handle for health reporting and shutdown.
    pub fn with_channel(mut self, channel: Arc<WorkerChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            channel: self
                .channel
                .as_ref()
                .map(|c| c.state())
                .unwrap_or(ChannelState::Unstarted),
            approval_pending: self.gate.is_armed(),
        }
    }

    pub fn approval_pending(&self) -> bool {
        self.gate.is_armed()
    }

    /// Turn the given LEDs on or off, one write-type command per identifier,
    /// sequentially. Aborts the remaining identifiers on the first failure.
    pub async fn set_leds(&self, leds: &[u32], on: bool) -> Result<(), ActionError> {
        let state = if on { "on" } else { "off" };
        for led in leds {
            self.port
                .send(&Command::write(format!("led {led} {state}")))
                .await?;
            self.journal
                .record(&format!("LED {led} turned {state}"))
                .await;
        }
        Ok(())
    }

    /// Gated open: wait for approval, then run the detection subprocess and
    /// report its outcome. No valid reading means a failed report, not an
    /// error.
    pub async fn open_door(&self) -> Result<DetectionReport, ActionError> {
        let armed = self.gate.arm()?;
        armed.approved().await?;

        let report = self
            .detector
            .run()
            .await
            .map_err(|e| ActionError::Detection(e.to_string()))?;

        let adc = report
            .adc
            .map(|v| v.to_string())
            .unwrap_or_else(|| "null".to_string());
        let outcome = if report.success { "Success" } else { "Failed" };
        self.journal
            .record(&format!("Door open attempt: {outcome}, ADC={adc}"))
            .await;

        Ok(report)
    }

    /// Gated close: wait for approval, then blink a warning and drive the
    /// door closed. Both commands are write-type; success is unconditional
    /// once both writes land.
    pub async fn close_door(&self) -> Result<(), ActionError> {
        let armed = self.gate.arm()?;
        armed.approved().await?;

        self.port.send(&Command::write("blink 0.5 5")).await?;
        self.port.send(&Command::write("close")).await?;

        self.journal.record("Door closed").await;
        Ok(())
    }

    /// Map one external approval event to exactly one gate release.
    pub async fn approve(&self) -> bool {
        let released = self.gate.approve();
        if released {
            self.journal.record("Authorization approved").await;
        }
        released
    }

    /// Read-type query: `read <channel>`, resolved with the worker's reply.
    pub async fn read_sensor(&self, channel: &str) -> Result<String, ActionError> {
        let reply = self
            .port
            .send(&Command::read(format!("read {channel}")))
            .await?;
        Ok(reply)
    }

    pub async fn logs(&self) -> std::io::Result<String> {
        self.journal.read_all().await
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Stop the worker gracefully. Pending approval waiters are cleared by
    /// their drop guards; pending reads fail with channel-closed.
    pub async fn shutdown(&self) {
        if let Some(channel) = &self.channel {
            channel.shutdown().await;
        }
        self.journal.record("Controller stopped").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records sent commands; optionally fails from the nth send onward and
    /// answers read-type commands with a canned reply.
    struct MockPort {
        sent: StdMutex<Vec<Command>>,
        fail_from: Option<usize>,
        read_reply: String,
    }

    impl MockPort {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                fail_from: None,
                read_reply: "123".to_string(),
            }
        }

        fn failing_from(n: usize) -> Self {
            Self {
                fail_from: Some(n),
                ..Self::new()
            }
        }

        fn sent(&self) -> Vec<Command> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandPort for MockPort {
        async fn send(&self, cmd: &Command) -> Result<String, RelayError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_from.is_some_and(|n| sent.len() >= n) {
                return Err(RelayError::ChannelClosed);
            }
            sent.push(cmd.clone());
            if cmd.expects_reply() {
                Ok(self.read_reply.clone())
            } else {
                Ok(crate::relay::WRITE_ACK.to_string())
            }
        }
    }

    fn detector(script: &str) -> DetectionRunner {
        DetectionRunner::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    fn service_with(port: Arc<MockPort>, script: &str) -> (Arc<ControllerService>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(Journal::new(dir.path().join("journal.log")));
        let service = Arc::new(ControllerService::new(port, detector(script), journal));
        (service, dir)
    }

    /// Runs a gated action while approving it from the side.
    async fn approve_when_armed(service: Arc<ControllerService>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !service.approval_pending() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(service.approve().await);
        })
        .await
        .expect("action never armed the gate");
    }

    #[tokio::test]
    async fn set_leds_issues_one_write_per_id_in_order() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(Arc::clone(&port), "true");

        service.set_leds(&[3, 1, 2], true).await.unwrap();

        let sent = port.sent();
        assert_eq!(
            sent,
            vec![
                Command::write("led 3 on"),
                Command::write("led 1 on"),
                Command::write("led 2 on"),
            ]
        );
    }

    #[tokio::test]
    async fn set_leds_aborts_remaining_on_first_failure() {
        let port = Arc::new(MockPort::failing_from(1));
        let (service, _dir) = service_with(Arc::clone(&port), "true");

        let result = service.set_leds(&[0, 1, 2], false).await;
        assert!(matches!(result, Err(ActionError::ChannelClosed)));
        assert_eq!(port.sent(), vec![Command::write("led 0 off")]);
    }

    #[tokio::test]
    async fn open_door_waits_for_approval_then_reports_detection() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) =
            service_with(Arc::clone(&port), r#"echo '{"result":true,"adc":512}'"#);

        let opener = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.open_door().await })
        };
        approve_when_armed(Arc::clone(&service)).await;

        let report = tokio::time::timeout(Duration::from_secs(5), opener)
            .await
            .expect("open action hung")
            .unwrap()
            .unwrap();
        assert!(report.success);
        assert_eq!(report.adc, Some(512.0));
    }

    #[tokio::test]
    async fn open_door_reports_failure_when_nothing_detected() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(Arc::clone(&port), r#"echo "garbage""#);

        let opener = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.open_door().await })
        };
        approve_when_armed(Arc::clone(&service)).await;

        let report = opener.await.unwrap().unwrap();
        assert!(!report.success);
        assert_eq!(report.adc, None);
    }

    #[tokio::test]
    async fn close_door_blinks_then_closes_after_approval() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(Arc::clone(&port), "true");

        let closer = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.close_door().await })
        };
        approve_when_armed(Arc::clone(&service)).await;

        tokio::time::timeout(Duration::from_secs(5), closer)
            .await
            .expect("close action hung")
            .unwrap()
            .unwrap();
        assert_eq!(
            port.sent(),
            vec![Command::write("blink 0.5 5"), Command::write("close")]
        );
    }

    #[tokio::test]
    async fn second_gated_action_is_rejected_while_first_pending() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(Arc::clone(&port), "true");

        let opener = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.open_door().await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !service.approval_pending() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // First action is still awaiting approval; the gate refuses a second.
        assert!(matches!(
            service.close_door().await,
            Err(ActionError::GateBusy)
        ));

        assert!(service.approve().await);
        opener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn approve_with_nothing_pending_is_noop() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(port, "true");

        assert!(!service.approve().await);
    }

    #[tokio::test]
    async fn read_sensor_returns_worker_reply() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(Arc::clone(&port), "true");

        let value = service.read_sensor("adc").await.unwrap();
        assert_eq!(value, "123");
        assert_eq!(port.sent(), vec![Command::read("read adc")]);
    }

    #[tokio::test]
    async fn actions_journal_their_outcomes() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(Arc::clone(&port), "true");

        service.set_leds(&[3], true).await.unwrap();
        let logs = service.logs().await.unwrap();
        assert!(logs.contains("LED 3 turned on"));
    }

    #[tokio::test]
    async fn health_without_channel_reports_unstarted() {
        let port = Arc::new(MockPort::new());
        let (service, _dir) = service_with(port, "true");

        let health = service.health();
        assert_eq!(health.channel, ChannelState::Unstarted);
        assert!(!health.approval_pending);
    }
}

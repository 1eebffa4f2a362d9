//! gatehouse server binary.
//!
//! Wires the kernel driver guard, journal, worker channel, relay, and
//! controller service together, then serves HTTP until shutdown.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::{
    CommandRelay, ControllerService, DetectionRunner, DriverGuard, GatehouseConfig, Journal,
    ScriptSpawner, WorkerChannel, transport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatehouseConfig::from_env();

    // Held for the whole process lifetime; rmmod runs when it drops.
    let _driver = DriverGuard::load(config.driver_module.as_deref()).await;

    let journal = Arc::new(Journal::new(&config.journal_path));
    journal.record("Controller started").await;

    let spawner = ScriptSpawner::new(&config.worker.program, config.worker.args.clone());
    let channel = WorkerChannel::start(&spawner, Arc::clone(&journal))?;
    let relay = Arc::new(CommandRelay::new(Arc::clone(&channel)));

    let detector = DetectionRunner::new(&config.detector.program, config.detector.args.clone());

    let service = Arc::new(
        ControllerService::new(relay, detector, journal).with_channel(channel),
    );

    transport::serve(config.server, service).await
}

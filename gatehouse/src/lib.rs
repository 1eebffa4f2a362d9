//! gatehouse: controller for a GPIO-driven door, mediating HTTP requests and
//! a long-lived worker subprocess.

mod channel;
mod detect;
mod driver;
mod gate;
mod journal;
mod relay;

pub mod config;
pub mod service;
pub mod transport;

pub use channel::{ChannelError, ChannelState, ScriptSpawner, SpawnError, WorkerChannel, WorkerSpawner};
pub use config::{CommandSpec, GatehouseConfig, ServerConfig};
pub use detect::{DetectionReport, DetectionRunner};
pub use driver::DriverGuard;
pub use gate::{AuthGate, GateError};
pub use journal::Journal;
pub use relay::{Command, CommandPort, CommandRelay, RelayError, WRITE_ACK};
pub use service::{ActionError, ControllerService, HealthSnapshot};

//! Runtime configuration.
//!
//! Defaults match the on-device deployment; every knob can be overridden
//! with a `GATEHOUSE_*` environment variable or the `with_*` builders.

use std::path::PathBuf;

/// One external command line (program plus arguments).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line, e.g. from an env var.
    /// Returns None for an empty string.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatehouseConfig {
    pub server: ServerConfig,
    /// The long-lived GPIO worker process.
    pub worker: CommandSpec,
    /// The one-shot camera detection process.
    pub detector: CommandSpec,
    /// Log device backing the journal.
    pub journal_path: PathBuf,
    /// Kernel module providing the log device; None skips load/unload.
    pub driver_module: Option<PathBuf>,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            worker: CommandSpec::new("python3", vec!["utils/gpio_control.py".to_string()]),
            detector: CommandSpec::new("python3", vec!["utils/camera_control.py".to_string()]),
            journal_path: PathBuf::from("/dev/log_driver"),
            driver_module: Some(PathBuf::from("driver/log_driver.ko")),
        }
    }
}

impl GatehouseConfig {
    /// Defaults overridden by `GATEHOUSE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("GATEHOUSE_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("GATEHOUSE_PORT") {
            match port.parse() {
                Ok(port) => config.server.port = port,
                Err(_) => {
                    tracing::warn!(%port, "ignoring unparseable GATEHOUSE_PORT")
                }
            }
        }
        if let Ok(raw) = std::env::var("GATEHOUSE_WORKER_CMD")
            && let Some(spec) = CommandSpec::parse(&raw)
        {
            config.worker = spec;
        }
        if let Ok(raw) = std::env::var("GATEHOUSE_DETECTOR_CMD")
            && let Some(spec) = CommandSpec::parse(&raw)
        {
            config.detector = spec;
        }
        if let Ok(path) = std::env::var("GATEHOUSE_JOURNAL") {
            config.journal_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("GATEHOUSE_DRIVER_MODULE") {
            config.driver_module = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }

        config
    }

    pub fn with_worker(mut self, worker: CommandSpec) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_detector(mut self, detector: CommandSpec) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_journal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = path.into();
        self
    }

    pub fn with_driver_module(mut self, module: Option<PathBuf>) -> Self {
        self.driver_module = module;
        self
    }
}

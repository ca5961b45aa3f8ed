//! Kernel configuration.

use std::path::Path;

use ember_core::{OutputConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};

use crate::error::ServerResult;

/// How the kernel relates to its host process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelMode {
    /// The kernel owns the process and exits it on shutdown.
    #[default]
    Standalone,
    /// The kernel runs inside a host that must survive shutdown.
    Embedded,
}

fn new_session() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub mode: KernelMode,
    /// Session id, used as the engine id in reply metadata.
    pub session: String,
    pub output: OutputConfig,
    pub scheduler: SchedulerConfig,
    /// Capacity of the broadcast channel feeding WebSocket clients.
    pub event_capacity: usize,
    /// Prefix marking meta-commands.
    pub meta_prefix: String,
    /// Also copy captured stdout to the process stderr.
    pub echo_output: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mode: KernelMode::Standalone,
            session: new_session(),
            output: OutputConfig::default(),
            scheduler: SchedulerConfig::default(),
            event_capacity: 1024,
            meta_prefix: ":".to_string(),
            echo_output: false,
        }
    }
}

impl KernelConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        self.output.validate()?;
        self.scheduler.validate()?;
        if self.event_capacity == 0 {
            return Err(ember_core::Error::Config("event_capacity must be positive".to_string()).into());
        }
        Ok(())
    }

    pub fn is_embedded(&self) -> bool {
        self.mode == KernelMode::Embedded
    }
}

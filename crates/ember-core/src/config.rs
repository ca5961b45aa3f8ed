//! Configuration for execution and output capture.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How output written during an execution is buffered and forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Whether stdout of executing code is forwarded to the front-end.
    pub capture_output: bool,
    /// Flush once complete lines reach this many bytes.
    pub newline_buffer_size: usize,
    /// Flush once buffered bytes reach this size, newline or not.
    pub max_buffer_size: usize,
    /// Bytes past this total are no longer captured for the execution.
    pub cell_output_max_size: usize,
    /// Periodic flush interval in milliseconds.
    pub flush_interval_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            capture_output: true,
            newline_buffer_size: 100,
            max_buffer_size: 1000,
            cell_output_max_size: 100_000,
            flush_interval_ms: 100,
        }
    }
}

impl OutputConfig {
    /// Periodic flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Check the thresholds are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(Error::Config("max_buffer_size must be positive".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Config("flush_interval_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// Execution scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of queued tasks before `submit` blocks.
    pub queue_capacity: usize,
    /// How long a cooperative interrupt may take before the worker is abandoned.
    pub interrupt_grace_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            interrupt_grace_ms: 100,
        }
    }
}

impl SchedulerConfig {
    /// Grace period granted to a cooperatively interrupted task.
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_defaults() {
        let config = OutputConfig::default();
        assert!(config.capture_output);
        assert_eq!(config.newline_buffer_size, 100);
        assert_eq!(config.max_buffer_size, 1000);
        assert_eq!(config.cell_output_max_size, 100_000);
        assert_eq!(config.flush_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: OutputConfig = serde_json::from_str(r#"{"max_buffer_size": 16}"#).unwrap();
        assert_eq!(config.max_buffer_size, 16);
        assert_eq!(config.newline_buffer_size, 100);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = SchedulerConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OutputConfig {
            flush_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

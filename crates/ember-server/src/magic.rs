//! Kernel meta-commands.
//!
//! A cell whose first non-blank character is the meta prefix (`:` by
//! default) is addressed to the kernel rather than the evaluator.

use ember_core::{DisplayData, Fault};

use crate::protocol::PROTOCOL_VERSION;
use crate::render::ExecuteResponse;

/// Fault kind for unrecognised meta-commands.
pub const UNKNOWN_COMMAND_KIND: &str = "UnknownCommand";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaCommand {
    Help,
    Version,
    Results,
    Counter,
}

impl MetaCommand {
    pub const ALL: [MetaCommand; 4] = [Self::Help, Self::Version, Self::Results, Self::Counter];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Version => "version",
            Self::Results => "results",
            Self::Counter => "counter",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Help => "list the available commands",
            Self::Version => "show kernel and protocol versions",
            Self::Results => "count in-memory results held by the kernel",
            Self::Counter => "show the current execution counter",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Kernel state a meta-command may report on.
#[derive(Debug, Clone, Copy)]
pub struct MetaState {
    pub execution_count: u64,
    pub live_results: usize,
}

/// Recognises and runs meta-commands.
#[derive(Debug, Clone)]
pub struct MetaCommands {
    prefix: String,
}

impl MetaCommands {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `code` is a meta-command.
    pub fn is_meta(&self, code: &str) -> bool {
        !self.prefix.is_empty() && code.trim_start().starts_with(&self.prefix)
    }

    /// Run a meta-command cell.
    pub fn run(&self, code: &str, state: MetaState) -> ExecuteResponse {
        let line = code.trim().trim_start_matches(self.prefix.as_str());
        let name = line.split_whitespace().next().unwrap_or("");

        let Some(command) = MetaCommand::parse(name) else {
            return ExecuteResponse::Error(Fault::new(
                UNKNOWN_COMMAND_KIND,
                format!("Unknown command: {}{}", self.prefix, name),
            ));
        };
        tracing::debug!(command = command.name(), "running meta-command");

        let text = match command {
            MetaCommand::Help => MetaCommand::ALL
                .iter()
                .map(|c| format!("{}{:<8} {}", self.prefix, c.name(), c.description()))
                .collect::<Vec<_>>()
                .join("\n"),
            MetaCommand::Version => format!(
                "Ember kernel v{} (protocol {})",
                env!("CARGO_PKG_VERSION"),
                PROTOCOL_VERSION
            ),
            MetaCommand::Results => state.live_results.to_string(),
            MetaCommand::Counter => state.execution_count.to_string(),
        };
        ExecuteResponse::Ok(Some(DisplayData::text(text)))
    }
}

impl Default for MetaCommands {
    fn default() -> Self {
        Self::new(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: MetaState = MetaState {
        execution_count: 4,
        live_results: 2,
    };

    fn text(response: ExecuteResponse) -> String {
        match response {
            ExecuteResponse::Ok(Some(data)) => data.data["text/plain"].as_str().unwrap().to_string(),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_detects_prefix() {
        let magics = MetaCommands::default();
        assert!(magics.is_meta(":help"));
        assert!(magics.is_meta("  \n:counter"));
        assert!(!magics.is_meta("1 + 1"));
        assert!(!MetaCommands::new("").is_meta(":help"));
    }

    #[test]
    fn test_builtin_commands() {
        let magics = MetaCommands::default();
        assert_eq!(text(magics.run(":counter", STATE)), "4");
        assert_eq!(text(magics.run(":results", STATE)), "2");
        assert!(text(magics.run(":version", STATE)).contains(PROTOCOL_VERSION));

        let help = text(magics.run(":help", STATE));
        for command in MetaCommand::ALL {
            assert!(help.contains(command.name()));
        }
    }

    #[test]
    fn test_unknown_command_is_error() {
        match MetaCommands::default().run(":frobnicate now", STATE) {
            ExecuteResponse::Error(fault) => {
                assert_eq!(fault.kind, UNKNOWN_COMMAND_KIND);
                assert_eq!(fault.message, "Unknown command: :frobnicate");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}

//! Per-execution I/O context.
//!
//! Nothing is redirected process-wide. Each execution gets its own
//! [`ExecutionIo`] carrying the writers, stdin source and display sink for
//! that request, and passes it to the evaluator explicitly.

use std::io::{self, Write};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::evaluator::DisplayData;

/// Line-oriented input for executing code.
pub trait StdinSource: Send + Sync {
    /// Ask the front-end for one line of input.
    fn read_line(&self, prompt: &str, password: bool) -> Result<String>;
}

/// Stdin used when the request did not allow input.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStdin;

impl StdinSource for DisabledStdin {
    fn read_line(&self, _prompt: &str, _password: bool) -> Result<String> {
        Err(Error::StdinDisabled)
    }
}

/// Receives rich display output produced mid-execution.
pub trait DisplaySink: Send + Sync {
    /// Show `data`. With `update`, replace the display carrying the same id.
    fn display(&self, data: DisplayData, update: bool);
}

/// Streams and input available to one execution.
pub struct ExecutionIo {
    stdout: Box<dyn Write + Send>,
    stderr: Box<dyn Write + Send>,
    stdin: Arc<dyn StdinSource>,
    display: Option<Arc<dyn DisplaySink>>,
}

impl ExecutionIo {
    pub fn new(
        stdout: Box<dyn Write + Send>,
        stderr: Box<dyn Write + Send>,
        stdin: Arc<dyn StdinSource>,
    ) -> Self {
        Self {
            stdout,
            stderr,
            stdin,
            display: None,
        }
    }

    /// I/O that discards output and refuses input.
    pub fn discard() -> Self {
        Self::new(
            Box::new(io::sink()),
            Box::new(io::sink()),
            Arc::new(DisabledStdin),
        )
    }

    /// Attach a display sink.
    pub fn with_display(mut self, display: Arc<dyn DisplaySink>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn stdout(&mut self) -> &mut (dyn Write + Send) {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> &mut (dyn Write + Send) {
        self.stderr.as_mut()
    }

    /// Read a line, flushing pending output first so prompts appear in order.
    pub fn read_line(&mut self, prompt: &str, password: bool) -> Result<String> {
        self.flush()?;
        self.stdin.read_line(prompt, password)
    }

    /// Emit a display. Dropped when no sink is attached.
    pub fn display(&self, data: DisplayData, update: bool) {
        match &self.display {
            Some(sink) => sink.display(data, update),
            None => tracing::debug!("display without a sink dropped"),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stdout.flush()?;
        self.stderr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_stdin_refuses() {
        let mut io = ExecutionIo::discard();
        let err = io.read_line("name?", false).unwrap_err();
        assert_eq!(err.to_string(), "Input from stdin is unsupported by the client");
    }

    #[test]
    fn test_custom_stdin() {
        struct Fixed;
        impl StdinSource for Fixed {
            fn read_line(&self, prompt: &str, _password: bool) -> Result<String> {
                Ok(format!("answer to {}", prompt))
            }
        }

        let mut io = ExecutionIo::new(Box::new(io::sink()), Box::new(io::sink()), Arc::new(Fixed));
        assert_eq!(io.read_line("q", false).unwrap(), "answer to q");
        writeln!(io.stdout(), "ignored").unwrap();
    }
}

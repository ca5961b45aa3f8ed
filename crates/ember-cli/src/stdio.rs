//! Stdio command implementation for Ember CLI.
//!
//! One JSON message per line in on stdin, one per line out on stdout.
//! End of input stops the kernel once every queued request is answered.

use std::io::{self, BufRead, stdin, stdout};
use std::sync::Arc;
use std::thread;

use ember_server::runner::wait_stopped;
use ember_server::{
    KernelConfig, KernelRunner, ProtocolDispatcher, ServerError, StopReason, WriterSink,
};
use tokio::sync::mpsc;

/// Read stdin lines on a dedicated thread.
///
/// A blocking read cannot be cancelled, so the thread is left behind when
/// the kernel stops before input ends.
fn spawn_reader() -> io::Result<mpsc::UnboundedReceiver<io::Result<String>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("ember-stdin".to_string())
        .spawn(move || {
            for line in stdin().lock().lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// Run the kernel over stdin and stdout until input ends or it shuts down.
pub async fn execute(config: KernelConfig) -> anyhow::Result<StopReason> {
    let (evaluator, comms) = crate::kernel_parts();
    let sink = Arc::new(WriterSink::new(stdout()));
    let dispatcher = ProtocolDispatcher::new(config, evaluator, comms, sink)?;
    let runner = Arc::new(KernelRunner::start(dispatcher)?);
    let mut lines = spawn_reader()?;

    let stopped = wait_stopped(runner.subscribe_stopped());
    tokio::pin!(stopped);

    let input_ended = loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = &mut stopped => break false,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                tracing::warn!("Failed to read input: {}", e);
                break true;
            }
            None => break true,
        };
        if line.trim().is_empty() {
            continue;
        }
        match runner.submit_raw(&line) {
            Ok(()) => {}
            Err(ServerError::KernelStopped) => break false,
            Err(e) => tracing::warn!("Failed to submit message: {}", e),
        }
    };

    let closing = runner.clone();
    tokio::task::spawn_blocking(move || {
        if input_ended {
            tracing::info!("input closed, finishing queued requests");
            closing.drain();
        }
        closing.close();
    })
    .await?;

    Ok(runner.stop_reason().unwrap_or(StopReason::Stopped))
}

//! Output capture for running executions.
//!
//! Text written by executing code is buffered and forwarded to a sink in
//! bounded chunks. A chunk is emitted when:
//!
//! - complete lines reach `newline_buffer_size` (only whole lines are sent),
//! - everything buffered reaches `max_buffer_size` (sent regardless of lines),
//! - the periodic flush timer fires.
//!
//! Bytes beyond `cell_output_max_size` are still echoed but no longer
//! captured. Writes and flushes share one lock, so chunks never interleave or
//! repeat even though the timer flushes from its own thread.

use std::io::{self, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::config::OutputConfig;

/// Which stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Protocol name of the stream.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One flushed run of captured text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChunk {
    pub stream: StreamKind,
    pub text: String,
}

/// Receives flushed chunks. Called with the capture lock held, so it must
/// not write back into the same capture.
pub type ChunkSink = Arc<dyn Fn(CapturedChunk) + Send + Sync>;

#[derive(Default)]
struct Buffers {
    /// Complete lines waiting to be sent.
    lines: Vec<u8>,
    /// Bytes of the current, unterminated line.
    pending: Vec<u8>,
    /// Bytes written so far, captured or not.
    total: usize,
    newline_found: bool,
    closed: bool,
}

/// Split `buf` into the text to send now and the bytes of a trailing,
/// incomplete UTF-8 sequence to keep for the next chunk.
fn take_text(buf: &mut Vec<u8>, keep_incomplete: bool) -> String {
    let cut = match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if keep_incomplete && e.error_len().is_none() => e.valid_up_to(),
        Err(_) => buf.len(),
    };
    let rest = buf.split_off(cut);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = rest;
    text
}

struct Inner {
    config: OutputConfig,
    stream: StreamKind,
    capture: bool,
    sink: ChunkSink,
    echo: Mutex<Option<Box<dyn Write + Send>>>,
    buffers: Mutex<Buffers>,
}

impl Inner {
    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, buf: &[u8]) -> io::Result<()> {
        {
            let mut echo = self.echo.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(out) = echo.as_mut() {
                out.write_all(buf)?;
            }
        }

        let mut buffers = self.buffers();
        if buffers.closed {
            return Ok(());
        }
        for &b in buf {
            buffers.total += 1;
            if !self.capture || buffers.total > self.config.cell_output_max_size {
                continue;
            }
            buffers.pending.push(b);
            self.flush_if_needed(&mut buffers, b);
        }
        Ok(())
    }

    fn flush_if_needed(&self, buffers: &mut Buffers, b: u8) {
        if b == b'\n' {
            buffers.newline_found = true;
            let pending = std::mem::take(&mut buffers.pending);
            buffers.lines.extend_from_slice(&pending);
        }

        let size = buffers.lines.len() + buffers.pending.len();
        if buffers.newline_found && size >= self.config.newline_buffer_size {
            self.flush_lines(buffers);
        } else if size >= self.config.max_buffer_size {
            self.flush_all(buffers, true);
        }
    }

    fn flush_lines(&self, buffers: &mut Buffers) {
        buffers.newline_found = false;
        let text = take_text(&mut buffers.lines, false);
        self.emit(text);
    }

    fn flush_all(&self, buffers: &mut Buffers, keep_incomplete: bool) {
        buffers.newline_found = false;
        let mut all = std::mem::take(&mut buffers.lines);
        all.append(&mut buffers.pending);
        let text = take_text(&mut all, keep_incomplete);
        buffers.pending = all;
        self.emit(text);
    }

    fn emit(&self, text: String) {
        if !text.is_empty() {
            (self.sink)(CapturedChunk {
                stream: self.stream,
                text,
            });
        }
    }

    fn flush(&self) {
        let mut buffers = self.buffers();
        self.flush_all(&mut buffers, true);
    }

    fn close(&self) {
        let mut buffers = self.buffers();
        if buffers.closed {
            return;
        }
        self.flush_all(&mut buffers, false);
        buffers.closed = true;

        let mut echo = self.echo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(out) = echo.as_mut() {
            let _ = out.flush();
        }
    }
}

/// Captures one output stream for the duration of an execution.
pub struct OutputCapture {
    inner: Arc<Inner>,
    timer: Mutex<Option<(mpsc::Sender<()>, thread::JoinHandle<()>)>>,
}

impl OutputCapture {
    /// Start capturing. `capture = false` only echoes.
    pub fn new(
        stream: StreamKind,
        config: OutputConfig,
        capture: bool,
        sink: ChunkSink,
    ) -> Self {
        Self::with_echo(stream, config, capture, sink, None)
    }

    /// Start capturing and also echo every byte to `echo`.
    pub fn with_echo(
        stream: StreamKind,
        config: OutputConfig,
        capture: bool,
        sink: ChunkSink,
        echo: Option<Box<dyn Write + Send>>,
    ) -> Self {
        let interval = config.flush_interval();
        let inner = Arc::new(Inner {
            config,
            stream,
            capture,
            sink,
            echo: Mutex::new(echo),
            buffers: Mutex::new(Buffers::default()),
        });

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let timer_inner = inner.clone();
        let timer = thread::Builder::new()
            .name(format!("ember-capture-{}", stream.as_str()))
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => timer_inner.flush(),
                        _ => break,
                    }
                }
            });
        let timer = match timer {
            Ok(handle) => Some((stop_tx, handle)),
            Err(e) => {
                tracing::warn!("periodic output flush unavailable: {}", e);
                None
            }
        };

        Self {
            inner,
            timer: Mutex::new(timer),
        }
    }

    /// A cloneable writer feeding this capture.
    pub fn writer(&self) -> CaptureWriter {
        CaptureWriter {
            inner: self.inner.clone(),
        }
    }

    /// Stream tag of this capture.
    pub fn stream(&self) -> StreamKind {
        self.inner.stream
    }

    /// Send whatever is buffered now.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Bytes buffered but not yet sent.
    pub fn buffered_len(&self) -> usize {
        let buffers = self.inner.buffers();
        buffers.lines.len() + buffers.pending.len()
    }

    /// Total bytes written, including those past the capture cap.
    pub fn total_written(&self) -> usize {
        self.inner.buffers().total
    }

    /// Stop the timer and send the remainder. Later writes are only echoed.
    pub fn close(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((stop, handle)) = timer {
            drop(stop);
            let _ = handle.join();
        }
        self.inner.close();
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// `Write` handle into an [`OutputCapture`].
#[derive(Clone)]
pub struct CaptureWriter {
    inner: Arc<Inner>,
}

impl CaptureWriter {
    /// Stream tag of the underlying capture.
    pub fn stream(&self) -> StreamKind {
        self.inner.stream
    }
}

impl Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush();
        Ok(())
    }
}

//! Per-channel message pumps in front of the dispatcher.
//!
//! Shell and control messages each get a dedicated thread so an interrupt
//! or shutdown is never stuck behind a long-running execute request. Stdin
//! replies are handed to the dispatcher on the caller's thread: the shell
//! thread is usually the one waiting for them.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::watch;

use crate::dispatcher::ProtocolDispatcher;
use crate::error::{ServerError, ServerResult};
use crate::protocol::{Channel, Message};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a kernel stopped accepting messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// End of input, a signal, or [`KernelRunner::close`].
    Stopped,
    /// An embedded kernel received a shutdown request.
    Shutdown,
    /// A standalone kernel received a shutdown request; the process should
    /// exit with status 0 once its transport has flushed.
    Exit,
}

fn mark_stopped(stopped: &watch::Sender<Option<StopReason>>, reason: StopReason) -> bool {
    stopped.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        true
    })
}

/// Owns the dispatcher and the threads feeding it.
pub struct KernelRunner {
    dispatcher: Arc<ProtocolDispatcher>,
    shell_tx: Mutex<Option<mpsc::Sender<Message>>>,
    control_tx: Mutex<Option<mpsc::Sender<Message>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: watch::Sender<Option<StopReason>>,
}

impl KernelRunner {
    /// Start the shell and control threads.
    pub fn start(dispatcher: ProtocolDispatcher) -> ServerResult<Self> {
        let dispatcher = Arc::new(dispatcher);
        let (stopped, _) = watch::channel(None);

        let (shell_tx, shell_rx) = mpsc::channel::<Message>();
        let (control_tx, control_rx) = mpsc::channel::<Message>();

        let shell = {
            let dispatcher = dispatcher.clone();
            thread::Builder::new()
                .name("ember-shell".to_string())
                .spawn(move || {
                    while let Ok(message) = shell_rx.recv() {
                        if let Err(e) = dispatcher.handle(message) {
                            tracing::error!("shell message failed: {}", e);
                        }
                    }
                    tracing::debug!("shell channel closed");
                })
                .map_err(|e| ServerError::Io(format!("cannot start shell thread: {}", e)))?
        };

        let control = {
            let dispatcher = dispatcher.clone();
            let stopped = stopped.clone();
            thread::Builder::new()
                .name("ember-control".to_string())
                .spawn(move || {
                    while let Ok(message) = control_rx.recv() {
                        let reason = match dispatcher.handle(message) {
                            Ok(()) => continue,
                            Err(ServerError::ShutdownRequested) => StopReason::Shutdown,
                            Err(ServerError::ExitRequested) => StopReason::Exit,
                            Err(e) => {
                                tracing::error!("control message failed: {}", e);
                                continue;
                            }
                        };
                        mark_stopped(&stopped, reason);
                        break;
                    }
                    tracing::debug!("control channel closed");
                })
                .map_err(|e| ServerError::Io(format!("cannot start control thread: {}", e)))?
        };

        tracing::info!(session = %dispatcher.config().session, "kernel started");

        Ok(Self {
            dispatcher,
            shell_tx: Mutex::new(Some(shell_tx)),
            control_tx: Mutex::new(Some(control_tx)),
            threads: Mutex::new(vec![shell, control]),
            stopped,
        })
    }

    pub fn dispatcher(&self) -> &Arc<ProtocolDispatcher> {
        &self.dispatcher
    }

    /// Route a decoded message to its channel.
    pub fn submit(&self, message: Message) -> ServerResult<()> {
        if self.is_stopped() {
            return Err(ServerError::KernelStopped);
        }
        let queue = match message.channel {
            Channel::Shell => &self.shell_tx,
            Channel::Control => &self.control_tx,
            Channel::Stdin | Channel::Event => return self.dispatcher.handle(message),
        };
        lock(queue)
            .as_ref()
            .ok_or(ServerError::KernelStopped)?
            .send(message)
            .map_err(|_| ServerError::KernelStopped)
    }

    /// Decode one JSON message and route it.
    ///
    /// Input that is not a message at all is answered with a `none` reply.
    pub fn submit_raw(&self, raw: &str) -> ServerResult<()> {
        match serde_json::from_str::<Message>(raw) {
            Ok(message) => self.submit(message),
            Err(e) => {
                if self.is_stopped() {
                    return Err(ServerError::KernelStopped);
                }
                self.dispatcher.reject_undecodable(raw, &e);
                Ok(())
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.borrow().is_some()
    }

    /// Why the kernel stopped, once it has.
    pub fn stop_reason(&self) -> Option<StopReason> {
        *self.stopped.borrow()
    }

    /// Receiver that holds the stop reason once the kernel stops.
    pub fn subscribe_stopped(&self) -> watch::Receiver<Option<StopReason>> {
        self.stopped.subscribe()
    }

    /// Mark the kernel stopped without a shutdown request (EOF, signals).
    pub fn request_stop(&self) {
        if mark_stopped(&self.stopped, StopReason::Stopped) {
            tracing::info!("kernel stop requested");
        }
    }

    /// Stop accepting messages, cancel work and join the pump threads.
    ///
    /// Blocks; call from a blocking context.
    pub fn close(&self) {
        self.request_stop();
        lock(&self.shell_tx).take();
        lock(&self.control_tx).take();
        self.dispatcher.close();
        self.join_threads();
        tracing::info!("kernel closed");
    }

    /// Stop accepting messages and wait until the queued ones are handled.
    ///
    /// Unlike [`close`](Self::close) nothing is interrupted, so this blocks
    /// for as long as the queued requests take.
    pub fn drain(&self) {
        lock(&self.shell_tx).take();
        lock(&self.control_tx).take();
        self.join_threads();
    }

    fn join_threads(&self) {
        let threads: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!("kernel thread panicked");
            }
        }
    }
}

impl Drop for KernelRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Wait until the kernel behind `stopped` stops or its runner is gone.
pub async fn wait_stopped(mut stopped: watch::Receiver<Option<StopReason>>) -> Option<StopReason> {
    stopped
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|reason| *reason)
}

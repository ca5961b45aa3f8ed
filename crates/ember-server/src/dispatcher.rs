//! Protocol dispatcher.
//!
//! Turns each inbound message into its reply sequence. Execute requests are
//! answered as
//!
//! ```text
//! status(busy) → execute_input → [stream…] → [execute_result | error] → execute_reply → status(idle)
//! ```
//!
//! with the body run on the [`ExecutionScheduler`]. Completion and
//! diagnostics requests are answered from background jobs so a long cell
//! never holds them up.
//!
//! `handle` may be called from several threads at once (the kernel runner
//! uses one per channel). Shared state is the atomic execution counter, the
//! echo target and the result registry.

use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_core::{
    ChunkSink, CapturedChunk, EvalRequest, Evaluator, ExecutionIo, ExecutionResult,
    ExecutionScheduler, InMemoryRegistry, NoOpRegistry, OutputCapture, ResultRegistry, StreamKind,
};
use serde_json::{Map, Value, json};

use crate::comm::CommManager;
use crate::config::KernelConfig;
use crate::display::{DisplayHandle, EchoTarget};
use crate::error::{ServerError, ServerResult};
use crate::magic::{MetaCommands, MetaState};
use crate::protocol::{
    Channel, CodeRequest, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CommTargetInfo,
    CompleteReply, CompleteRequest, ErrorContent, ExecuteInput, ExecuteReply, ExecuteRequest,
    ExecuteResult, Header, HistoryReply, IsCompleteReply, KernelInfoReply, ListErrorsReply,
    Message, PROTOCOL_VERSION, ReplyStatus, Request, StreamContent, msg_type, now_timestamp,
};
use crate::render::ExecuteResponse;
use crate::sink::{MessageSink, Outbox};
use crate::stdin::StdinGate;

/// Name given to the scheduled task for `code`.
pub fn execution_name(code: &str) -> String {
    let first: String = code.split('\n').next().unwrap_or("").chars().take(20).collect();
    if first.chars().count() < code.chars().count() {
        format!("Execution of code '{}...'", first)
    } else {
        format!("Execution of code '{}'", code)
    }
}

fn error_content(fault: &ember_core::Fault) -> ErrorContent {
    ErrorContent {
        ename: fault.kind.clone(),
        evalue: fault.message.clone(),
        traceback: fault.trace.clone(),
    }
}

/// Routes protocol messages to their handlers.
pub struct ProtocolDispatcher {
    config: KernelConfig,
    scheduler: ExecutionScheduler,
    evaluator: Arc<dyn Evaluator>,
    registry: Arc<dyn ResultRegistry>,
    comms: Arc<dyn CommManager>,
    outbox: Outbox,
    stdin: Arc<StdinGate>,
    echo: EchoTarget,
    magics: MetaCommands,
    counter: AtomicU64,
}

impl ProtocolDispatcher {
    /// Create a dispatcher and start its execution worker.
    ///
    /// Embedded kernels keep in-memory results; standalone ones have nobody
    /// who could read them and use a no-op registry.
    pub fn new(
        config: KernelConfig,
        evaluator: Arc<dyn Evaluator>,
        comms: Arc<dyn CommManager>,
        sink: Arc<dyn MessageSink>,
    ) -> ServerResult<Self> {
        config.validate()?;

        let scheduler = ExecutionScheduler::new(config.scheduler.clone())?;
        let outbox = Outbox::new(sink, config.session.clone());
        let registry: Arc<dyn ResultRegistry> = if config.is_embedded() {
            Arc::new(InMemoryRegistry::new())
        } else {
            Arc::new(NoOpRegistry)
        };

        Ok(Self {
            magics: MetaCommands::new(config.meta_prefix.clone()),
            stdin: Arc::new(StdinGate::new(outbox.clone())),
            config,
            scheduler,
            evaluator,
            registry,
            comms,
            outbox,
            echo: EchoTarget::default(),
            counter: AtomicU64::new(1),
        })
    }

    /// Replace the result registry.
    pub fn with_registry(mut self, registry: Arc<dyn ResultRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &ExecutionScheduler {
        &self.scheduler
    }

    pub fn registry(&self) -> &Arc<dyn ResultRegistry> {
        &self.registry
    }

    /// Counter value the next history-tracked execution will get.
    pub fn execution_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Whether an execute request is waiting for an `input_reply`.
    pub fn is_waiting_for_input(&self) -> bool {
        self.stdin.is_waiting()
    }

    /// Stop the execution worker and cancel background jobs.
    pub fn close(&self) {
        self.scheduler.close();
    }

    /// Handle one inbound message.
    ///
    /// Only a shutdown request returns an error: [`ServerError::ShutdownRequested`]
    /// when embedded, [`ServerError::ExitRequested`] when standalone. Everything
    /// else is answered on the wire.
    pub fn handle(&self, message: Message) -> ServerResult<()> {
        tracing::debug!(
            channel = ?message.channel,
            msg_type = message.msg_type(),
            msg_id = %message.header.msg_id,
            "dispatching message"
        );
        match message.channel {
            Channel::Control => self.handle_control(&message),
            Channel::Shell => {
                self.handle_shell(&message);
                Ok(())
            }
            Channel::Stdin => {
                self.handle_stdin(&message);
                Ok(())
            }
            Channel::Event => {
                tracing::debug!(msg_type = message.msg_type(), "inbound event message ignored");
                Ok(())
            }
        }
    }

    /// Answer input that could not be decoded into a message at all.
    pub fn reject_undecodable(&self, raw: &str, error: &dyn std::fmt::Display) {
        tracing::warn!("failed to decode message: {} (input: {})", error, raw);
        self.outbox
            .send_unsolicited(Channel::Shell, msg_type::NONE, &json!({}));
    }

    fn handle_control(&self, message: &Message) -> ServerResult<()> {
        let request = match Request::decode(message) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(msg_type = message.msg_type(), "malformed control message: {}", e);
                return Ok(());
            }
        };
        match request {
            Request::Interrupt => {
                self.interrupt(message);
                Ok(())
            }
            Request::Shutdown(_) => self.shutdown(message),
            other => {
                tracing::debug!(request = ?other, "unhandled control message ignored");
                Ok(())
            }
        }
    }

    fn handle_stdin(&self, message: &Message) {
        match Request::decode(message) {
            Ok(Request::InputReply(reply)) => {
                self.stdin.deliver(reply);
            }
            Ok(other) => tracing::debug!(request = ?other, "unhandled stdin message ignored"),
            Err(e) => tracing::warn!("malformed stdin message: {}", e),
        }
    }

    fn handle_shell(&self, message: &Message) {
        let request = match Request::decode(message) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(msg_type = message.msg_type(), "malformed shell message: {}", e);
                self.reply_none(&message.header);
                return;
            }
        };
        let parent = &message.header;

        match request {
            Request::KernelInfo => self.kernel_info(parent),
            Request::Execute(request) => self.execute(parent, request),
            Request::Complete(request) => self.complete(parent, request),
            Request::ListErrors(request) => self.list_errors(parent, request),
            Request::IsComplete(request) => self.is_complete(parent, request),
            Request::History => self.outbox.wrapped(parent, || {
                self.outbox.send(
                    parent,
                    Channel::Shell,
                    msg_type::HISTORY_REPLY,
                    &HistoryReply {
                        status: ReplyStatus::Ok,
                        history: Vec::new(),
                    },
                );
            }),
            Request::Connect => self.outbox.wrapped(parent, || {
                self.outbox
                    .send(parent, Channel::Shell, msg_type::CONNECT_REPLY, &json!({}));
            }),
            Request::CommInfo(request) => self.comm_info(parent, request),
            Request::CommOpen(open) => self.comm_open(parent, open),
            Request::CommMsg(msg) => self.comm_msg(parent, msg),
            Request::CommClose(msg) => self.comm_close(parent, msg),
            Request::Interrupt
            | Request::Shutdown(_)
            | Request::InputReply(_)
            | Request::Unknown(_) => self.reply_none(parent),
        }
    }

    fn reply_none(&self, parent: &Header) {
        tracing::debug!(msg_type = %parent.msg_type, "replying none to unhandled request");
        self.outbox
            .send(parent, Channel::Shell, msg_type::NONE, &json!({}));
    }

    // --- control ---

    fn interrupt(&self, message: &Message) {
        let outcome = self.scheduler.interrupt_current();
        tracing::info!(?outcome, "interrupt request handled");
        self.outbox.send(
            &message.header,
            Channel::Control,
            msg_type::INTERRUPT_REPLY,
            &message.content,
        );
    }

    fn shutdown(&self, message: &Message) -> ServerResult<()> {
        let evaluator = self.evaluator.clone();
        if catch_unwind(AssertUnwindSafe(|| evaluator.on_shutdown())).is_err() {
            tracing::warn!("evaluator shutdown hook panicked");
        }
        self.outbox.send(
            &message.header,
            Channel::Control,
            msg_type::SHUTDOWN_REPLY,
            &message.content,
        );

        if self.config.is_embedded() {
            tracing::info!("shutdown requested; stopping embedded kernel");
            Err(ServerError::ShutdownRequested)
        } else {
            tracing::info!("shutdown requested; process will exit");
            Err(ServerError::ExitRequested)
        }
    }

    // --- shell ---

    fn kernel_info(&self, parent: &Header) {
        let language_info = self.evaluator.language();
        let version = env!("CARGO_PKG_VERSION");
        let reply = KernelInfoReply {
            status: ReplyStatus::Ok,
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: "ember".to_string(),
            implementation_version: version.to_string(),
            banner: format!(
                "Ember kernel v{}, {} v{}",
                version, language_info.name, language_info.version
            ),
            language_info,
            help_links: Vec::new(),
        };
        self.outbox.wrapped(parent, || {
            self.outbox
                .send(parent, Channel::Shell, msg_type::KERNEL_INFO_REPLY, &reply);
        });
    }

    fn advance_counter(&self, store_history: bool) -> u64 {
        if store_history {
            self.counter.fetch_add(1, Ordering::SeqCst)
        } else {
            self.counter.load(Ordering::SeqCst)
        }
    }

    fn execute(&self, parent: &Header, request: ExecuteRequest) {
        let _echo = self.echo.bind(parent);
        let count = self.advance_counter(request.store_history);
        let started = now_timestamp();

        self.outbox.wrapped(parent, || {
            self.outbox.send(
                parent,
                Channel::Event,
                msg_type::EXECUTE_INPUT,
                &ExecuteInput {
                    code: request.code.clone(),
                    execution_count: count,
                },
            );

            let response = if self.magics.is_meta(&request.code) {
                self.magics.run(
                    &request.code,
                    MetaState {
                        execution_count: self.execution_count(),
                        live_results: self.registry.size(),
                    },
                )
            } else {
                self.evaluate(parent, &request, count)
            };

            self.send_response(parent, response, count, &started);
        });
    }

    fn stream_sink(&self, parent: &Header) -> ChunkSink {
        let outbox = self.outbox.clone();
        let parent = parent.clone();
        Arc::new(move |chunk: CapturedChunk| {
            outbox.send(
                &parent,
                Channel::Event,
                msg_type::STREAM,
                &StreamContent {
                    name: chunk.stream.as_str().to_string(),
                    text: chunk.text,
                },
            );
        })
    }

    fn evaluate(&self, parent: &Header, request: &ExecuteRequest, count: u64) -> ExecuteResponse {
        let output = &self.config.output;
        let echo: Option<Box<dyn Write + Send>> = if self.config.echo_output {
            Some(Box::new(std::io::stderr()))
        } else {
            None
        };
        let stdout = OutputCapture::with_echo(
            StreamKind::Stdout,
            output.clone(),
            output.capture_output,
            self.stream_sink(parent),
            echo,
        );
        let stderr = OutputCapture::new(
            StreamKind::Stderr,
            output.clone(),
            true,
            self.stream_sink(parent),
        );
        let _stdin = self.stdin.open(parent, request.allow_stdin);

        let display = DisplayHandle::new(self.outbox.clone(), self.echo.clone(), parent.clone());
        let io = ExecutionIo::new(
            Box::new(stdout.writer()),
            Box::new(stderr.writer()),
            self.stdin.clone(),
        )
        .with_display(Arc::new(display));

        let evaluator = self.evaluator.clone();
        let eval_request = EvalRequest {
            code: request.code.clone(),
            execution_count: count,
            store_history: request.store_history,
            silent: request.silent,
        };
        let result = self.scheduler.submit(
            execution_name(&request.code),
            self.evaluator.context_token(),
            move |task| {
                let mut io = io;
                evaluator.eval(&eval_request, &mut io, task)
            },
        );

        stdout.close();
        stderr.close();

        match result {
            Ok(result) => ExecuteResponse::from_result(result, self.registry.as_ref()),
            Err(e) => {
                tracing::error!("execution could not be scheduled: {}", e);
                ExecuteResponse::Abort(e.to_string())
            }
        }
    }

    fn send_response(&self, parent: &Header, response: ExecuteResponse, count: u64, started: &str) {
        let (status, error) = match &response {
            ExecuteResponse::Ok(data) => {
                if let Some(data) = data {
                    self.outbox.send(
                        parent,
                        Channel::Event,
                        msg_type::EXECUTE_RESULT,
                        &ExecuteResult {
                            execution_count: count,
                            data: data.data.clone(),
                            metadata: data.metadata.clone(),
                        },
                    );
                }
                (ReplyStatus::Ok, None)
            }
            ExecuteResponse::Error(fault) => {
                tracing::debug!(kind = %fault.kind, "execution failed: {}", fault.message);
                let error = error_content(fault);
                self.outbox
                    .send(parent, Channel::Event, msg_type::ERROR, &error);
                (ReplyStatus::Error, Some(error))
            }
            ExecuteResponse::Abort(message) => {
                tracing::info!("execution aborted: {}", message);
                self.outbox.send(
                    parent,
                    Channel::Event,
                    msg_type::STREAM,
                    &StreamContent {
                        name: StreamKind::Stderr.as_str().to_string(),
                        text: message.clone(),
                    },
                );
                (ReplyStatus::Abort, None)
            }
        };

        let ok = status == ReplyStatus::Ok;
        let reply = ExecuteReply {
            status,
            execution_count: count,
            error,
            payload: ok.then(Vec::new),
            user_expressions: ok.then(Map::new),
        };

        let mut metadata = Map::new();
        metadata.insert("dependencies_met".to_string(), Value::Bool(true));
        metadata.insert(
            "engine".to_string(),
            Value::String(self.outbox.session().to_string()),
        );
        metadata.insert("status".to_string(), json!(status));
        metadata.insert("started".to_string(), Value::String(started.to_string()));

        self.outbox.send_with_metadata(
            parent,
            Channel::Shell,
            msg_type::EXECUTE_REPLY,
            &reply,
            metadata,
        );
    }

    fn complete(&self, parent: &Header, request: CompleteRequest) {
        let evaluator = self.evaluator.clone();
        let outbox = self.outbox.clone();
        let job_parent = parent.clone();
        let launched = self.scheduler.jobs().launch_blocking("complete", move || {
            let result = evaluator.complete(&request.code, request.cursor_pos);
            outbox.wrapped(&job_parent, || {
                outbox.send(
                    &job_parent,
                    Channel::Shell,
                    msg_type::COMPLETE_REPLY,
                    &CompleteReply {
                        status: ReplyStatus::Ok,
                        matches: result.matches,
                        cursor_start: result.cursor_start,
                        cursor_end: result.cursor_end,
                        metadata: Map::new(),
                    },
                );
            });
        });
        if let Err(e) = launched {
            tracing::warn!("completion job not started: {}", e);
            self.reply_none(parent);
        }
    }

    fn list_errors(&self, parent: &Header, request: CodeRequest) {
        let evaluator = self.evaluator.clone();
        let outbox = self.outbox.clone();
        let job_parent = parent.clone();
        let launched = self.scheduler.jobs().launch_blocking("list_errors", move || {
            let errors = evaluator.list_errors(&request.code);
            outbox.wrapped(&job_parent, || {
                outbox.send(
                    &job_parent,
                    Channel::Shell,
                    msg_type::LIST_ERRORS_REPLY,
                    &ListErrorsReply {
                        code: request.code,
                        errors,
                    },
                );
            });
        });
        if let Err(e) = launched {
            tracing::warn!("diagnostics job not started: {}", e);
            self.reply_none(parent);
        }
    }

    fn is_complete(&self, parent: &Header, request: CodeRequest) {
        let status = if self.magics.is_meta(&request.code) {
            ember_core::CompletenessStatus::Complete
        } else {
            self.evaluator.check_complete(&request.code)
        };
        self.outbox.wrapped(parent, || {
            self.outbox.send(
                parent,
                Channel::Shell,
                msg_type::IS_COMPLETE_REPLY,
                &IsCompleteReply { status },
            );
        });
    }

    fn comm_info(&self, parent: &Header, request: CommInfoRequest) {
        let comms = self
            .comms
            .comms(request.target_name.as_deref())
            .into_iter()
            .map(|info| {
                (
                    info.comm_id,
                    CommTargetInfo {
                        target_name: info.target_name,
                    },
                )
            })
            .collect();
        self.outbox.wrapped(parent, || {
            self.outbox.send(
                parent,
                Channel::Shell,
                msg_type::COMM_INFO_REPLY,
                &CommInfoReply {
                    status: ReplyStatus::Ok,
                    comms,
                },
            );
        });
    }

    fn comm_open(&self, parent: &Header, open: CommOpen) {
        let comms = self.comms.clone();
        let comm_id = open.comm_id.clone();
        let name = format!(
            "Execution of comm_open request for {} of target {}",
            open.comm_id, open.target_name
        );
        let result = self.scheduler.submit(name, self.evaluator.context_token(), move |_| {
            comms
                .open(&open.comm_id, &open.target_name, &open.data)
                .map(|()| None)
        });
        self.finish_comm(parent, &comm_id, msg_type::COMM_OPEN, result);
    }

    fn comm_msg(&self, parent: &Header, msg: CommMsg) {
        let comms = self.comms.clone();
        let comm_id = msg.comm_id.clone();
        let name = format!("Execution of comm_msg request for {}", msg.comm_id);
        let result = self.scheduler.submit(name, self.evaluator.context_token(), move |_| {
            comms.message(&msg.comm_id, &msg.data)
        });
        self.finish_comm(parent, &comm_id, msg_type::COMM_MSG, result);
    }

    fn comm_close(&self, parent: &Header, msg: CommMsg) {
        let comms = self.comms.clone();
        let comm_id = msg.comm_id.clone();
        let name = format!("Execution of comm_close request for {}", msg.comm_id);
        let result = self.scheduler.submit(name, self.evaluator.context_token(), move |_| {
            comms.close(&msg.comm_id, &msg.data).map(|()| None)
        });
        self.finish_comm(parent, &comm_id, msg_type::COMM_CLOSE, result);
    }

    /// Comm requests have no reply of their own. Data returned by a handler
    /// goes back as `comm_msg`; faults are surfaced as `error` events.
    fn finish_comm(
        &self,
        parent: &Header,
        comm_id: &str,
        kind: &str,
        result: ember_core::Result<ExecutionResult<Option<Value>>>,
    ) {
        match result {
            Ok(ExecutionResult::Success(Some(data))) => self.outbox.send(
                parent,
                Channel::Event,
                msg_type::COMM_MSG,
                &CommMsg {
                    comm_id: comm_id.to_string(),
                    data,
                },
            ),
            Ok(ExecutionResult::Success(None)) => {}
            Ok(ExecutionResult::Failure(fault)) => {
                tracing::warn!(comm_id, request = kind, "comm handler failed: {}", fault);
                self.outbox
                    .send(parent, Channel::Event, msg_type::ERROR, &error_content(&fault));
            }
            Ok(ExecutionResult::Interrupted) => {
                tracing::info!(comm_id, request = kind, "comm handler interrupted");
            }
            Err(e) => tracing::error!(comm_id, request = kind, "comm request not run: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_name() {
        assert_eq!(execution_name("1+1"), "Execution of code '1+1'");
        assert_eq!(
            execution_name("let x = 1\nx"),
            "Execution of code 'let x = 1...'"
        );
        assert_eq!(
            execution_name("print(\"a very long line of code\")"),
            "Execution of code 'print(\"a very long l...'"
        );
    }
}

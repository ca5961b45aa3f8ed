//! Outbound message delivery.

use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::protocol::{
    Channel, ExecutionState, Header, KERNEL_USERNAME, Message, StatusContent, msg_type,
};

/// Where outbound messages go.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: Message);
}

/// Fans messages out to every subscriber of a broadcast channel.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Message>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<Message>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    /// Subscribe to messages sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }
}

impl MessageSink for BroadcastSink {
    fn send(&self, message: Message) {
        // No subscribers is fine; nobody is listening yet.
        let _ = self.tx.send(message);
    }
}

/// Writes one JSON message per line, flushing after each.
pub struct WriterSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl<W: Write + Send> MessageSink for WriterSink<W> {
    fn send(&self, message: Message) {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(msg_type = message.msg_type(), "failed to encode message: {}", e);
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            tracing::warn!("failed to write message: {}", e);
        }
    }
}

/// Collects messages in memory.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<Message>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages of one type, in order.
    pub fn of_type(&self, msg_type: &str) -> Vec<Message> {
        self.messages()
            .into_iter()
            .filter(|m| m.msg_type() == msg_type)
            .collect()
    }

    /// Wait until a message of `msg_type` shows up.
    pub fn wait_for(&self, msg_type: &str, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.of_type(msg_type).into_iter().next() {
                return Some(message);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn clear(&self) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MessageSink for RecordingSink {
    fn send(&self, message: Message) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}

fn to_content<T: Serialize>(content: &T) -> Value {
    serde_json::to_value(content).unwrap_or_else(|e| {
        tracing::error!("failed to encode message content: {}", e);
        Value::Object(Map::new())
    })
}

/// Builds replies and events for a session and hands them to the sink.
#[derive(Clone)]
pub struct Outbox {
    sink: Arc<dyn MessageSink>,
    session: String,
}

impl Outbox {
    pub fn new(sink: Arc<dyn MessageSink>, session: impl Into<String>) -> Self {
        Self {
            sink,
            session: session.into(),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Send `content` as `msg_type` in answer to `parent`.
    pub fn send<T: Serialize>(&self, parent: &Header, channel: Channel, msg_type: &str, content: &T) {
        self.sink
            .send(Message::reply_to(parent, channel, msg_type, to_content(content)));
    }

    pub fn send_with_metadata<T: Serialize>(
        &self,
        parent: &Header,
        channel: Channel,
        msg_type: &str,
        content: &T,
        metadata: Map<String, Value>,
    ) {
        let message =
            Message::reply_to(parent, channel, msg_type, to_content(content)).with_metadata(metadata);
        self.sink.send(message);
    }

    /// Send a message that answers no request.
    pub fn send_unsolicited<T: Serialize>(&self, channel: Channel, msg_type: &str, content: &T) {
        self.sink.send(Message {
            channel,
            header: Header::new(msg_type, self.session.clone(), KERNEL_USERNAME),
            parent_header: None,
            metadata: Map::new(),
            content: to_content(content),
        });
    }

    pub fn status(&self, parent: &Header, execution_state: ExecutionState) {
        self.send(
            parent,
            Channel::Event,
            msg_type::STATUS,
            &StatusContent { execution_state },
        );
    }

    /// Run `body` framed by `busy` and `idle` status events.
    ///
    /// `idle` is sent even if `body` panics.
    pub fn wrapped<T>(&self, parent: &Header, body: impl FnOnce() -> T) -> T {
        struct Idle<'a> {
            outbox: &'a Outbox,
            parent: &'a Header,
        }
        impl Drop for Idle<'_> {
            fn drop(&mut self) {
                self.outbox.status(self.parent, ExecutionState::Idle);
            }
        }

        self.status(parent, ExecutionState::Busy);
        let _idle = Idle {
            outbox: self,
            parent,
        };
        body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> Header {
        Header::new(msg_type::EXECUTE_REQUEST, "s1", "alice")
    }

    #[test]
    fn test_wrapped_frames_with_busy_idle() {
        let sink = Arc::new(RecordingSink::new());
        let outbox = Outbox::new(sink.clone(), "s1");
        let parent = parent();

        let value = outbox.wrapped(&parent, || {
            outbox.send(&parent, Channel::Shell, "middle", &serde_json::json!({}));
            5
        });
        assert_eq!(value, 5);

        let types: Vec<_> = sink.messages().iter().map(|m| m.msg_type().to_string()).collect();
        assert_eq!(types, vec!["status", "middle", "status"]);
        let messages = sink.messages();
        assert_eq!(messages[0].content["execution_state"], "busy");
        assert_eq!(messages[2].content["execution_state"], "idle");
        assert!(messages.iter().all(|m| m.parent_id() == Some(parent.msg_id.as_str())));
    }

    #[test]
    fn test_writer_sink_writes_lines() {
        let sink = WriterSink::new(Vec::new());
        sink.send(Message::request(Channel::Shell, "a", "s", serde_json::json!({})));
        sink.send(Message::request(Channel::Shell, "b", "s", serde_json::json!({})));

        let out = sink.out.into_inner().unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Message = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.msg_type(), "a");
    }

    #[test]
    fn test_broadcast_sink_reaches_subscribers() {
        let (sink, mut rx) = BroadcastSink::new(8);
        let mut late = sink.subscribe();
        sink.send(Message::request(Channel::Event, "x", "s", serde_json::json!({})));
        assert_eq!(rx.try_recv().unwrap().msg_type(), "x");
        assert_eq!(late.try_recv().unwrap().msg_type(), "x");
    }
}

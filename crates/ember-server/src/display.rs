//! Display output bound to the request that produced it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ember_core::{DisplayData, DisplaySink};
use serde_json::{Map, Value};

use crate::protocol::{Channel, DisplayDataContent, Header, msg_type};
use crate::sink::Outbox;

/// The execute request display output is currently attributed to.
#[derive(Clone, Default)]
pub struct EchoTarget {
    current: Arc<Mutex<Option<Header>>>,
}

impl EchoTarget {
    fn lock(&self) -> MutexGuard<'_, Option<Header>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `header` the target until the guard drops.
    pub fn bind(&self, header: &Header) -> EchoGuard {
        *self.lock() = Some(header.clone());
        EchoGuard {
            target: self.clone(),
            msg_id: header.msg_id.clone(),
        }
    }

    pub fn current(&self) -> Option<Header> {
        self.lock().clone()
    }

    pub fn is_current(&self, msg_id: &str) -> bool {
        self.lock().as_ref().is_some_and(|h| h.msg_id == msg_id)
    }
}

/// Clears the echo target when dropped, unless another request took over.
pub struct EchoGuard {
    target: EchoTarget,
    msg_id: String,
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        let mut current = self.target.lock();
        if current.as_ref().is_some_and(|h| h.msg_id == self.msg_id) {
            *current = None;
        }
    }
}

/// Sends display output for one execute request.
///
/// Output is only forwarded while that request is the echo target.
pub struct DisplayHandle {
    outbox: Outbox,
    echo: EchoTarget,
    parent: Header,
}

impl DisplayHandle {
    pub fn new(outbox: Outbox, echo: EchoTarget, parent: Header) -> Self {
        Self {
            outbox,
            echo,
            parent,
        }
    }
}

impl DisplaySink for DisplayHandle {
    fn display(&self, data: DisplayData, update: bool) {
        if !self.echo.is_current(&self.parent.msg_id) {
            tracing::debug!(
                parent = %self.parent.msg_id,
                "display after its request finished dropped"
            );
            return;
        }

        let mut transient = Map::new();
        if let Some(id) = &data.display_id {
            transient.insert("display_id".to_string(), Value::String(id.clone()));
        } else if update {
            tracing::warn!("update_display_data without a display id dropped");
            return;
        }

        let kind = if update {
            msg_type::UPDATE_DISPLAY_DATA
        } else {
            msg_type::DISPLAY_DATA
        };
        self.outbox.send(
            &self.parent,
            Channel::Event,
            kind,
            &DisplayDataContent {
                data: data.data,
                metadata: data.metadata,
                transient,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::RecordingSink;

    fn header() -> Header {
        Header::new(msg_type::EXECUTE_REQUEST, "s", "u")
    }

    #[test]
    fn test_guard_clears_target() {
        let echo = EchoTarget::default();
        let first = header();
        {
            let _guard = echo.bind(&first);
            assert!(echo.is_current(&first.msg_id));
        }
        assert!(echo.current().is_none());
    }

    #[test]
    fn test_stale_guard_keeps_newer_target() {
        let echo = EchoTarget::default();
        let first = header();
        let second = header();
        let old = echo.bind(&first);
        let _new = echo.bind(&second);
        drop(old);
        assert!(echo.is_current(&second.msg_id));
    }

    #[test]
    fn test_display_only_while_current() {
        let sink = Arc::new(RecordingSink::new());
        let echo = EchoTarget::default();
        let parent = header();
        let handle = DisplayHandle::new(Outbox::new(sink.clone(), "s"), echo.clone(), parent.clone());

        {
            let _guard = echo.bind(&parent);
            handle.display(DisplayData::text("a").with_display_id("d1"), false);
            handle.display(DisplayData::text("b").with_display_id("d1"), true);
            handle.display(DisplayData::text("no id"), true);
        }
        handle.display(DisplayData::text("late"), false);

        let messages = sink.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].msg_type(), msg_type::DISPLAY_DATA);
        assert_eq!(messages[0].content["transient"]["display_id"], "d1");
        assert_eq!(messages[1].msg_type(), msg_type::UPDATE_DISPLAY_DATA);
        assert_eq!(messages[1].content["data"]["text/plain"], "b");
        assert_eq!(messages[1].channel, Channel::Event);
    }
}

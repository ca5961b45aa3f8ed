//! Kernel wire protocol.
//!
//! Messages follow the Jupyter layout: a header, the parent header of the
//! request being answered, metadata and a typed content body, plus the
//! logical channel the message travels on.

use chrono::{SecondsFormat, Utc};
use ember_core::{CompletenessStatus, Diagnostic, LanguageInfo};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Protocol version announced in headers and `kernel_info_reply`.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username used on messages the kernel originates.
pub const KERNEL_USERNAME: &str = "kernel";

/// Message type names.
pub mod msg_type {
    pub const KERNEL_INFO_REQUEST: &str = "kernel_info_request";
    pub const KERNEL_INFO_REPLY: &str = "kernel_info_reply";
    pub const EXECUTE_REQUEST: &str = "execute_request";
    pub const EXECUTE_REPLY: &str = "execute_reply";
    pub const EXECUTE_INPUT: &str = "execute_input";
    pub const EXECUTE_RESULT: &str = "execute_result";
    pub const ERROR: &str = "error";
    pub const STREAM: &str = "stream";
    pub const STATUS: &str = "status";
    pub const DISPLAY_DATA: &str = "display_data";
    pub const UPDATE_DISPLAY_DATA: &str = "update_display_data";
    pub const COMPLETE_REQUEST: &str = "complete_request";
    pub const COMPLETE_REPLY: &str = "complete_reply";
    pub const LIST_ERRORS_REQUEST: &str = "list_errors_request";
    pub const LIST_ERRORS_REPLY: &str = "list_errors_reply";
    pub const IS_COMPLETE_REQUEST: &str = "is_complete_request";
    pub const IS_COMPLETE_REPLY: &str = "is_complete_reply";
    pub const HISTORY_REQUEST: &str = "history_request";
    pub const HISTORY_REPLY: &str = "history_reply";
    pub const CONNECT_REQUEST: &str = "connect_request";
    pub const CONNECT_REPLY: &str = "connect_reply";
    pub const COMM_INFO_REQUEST: &str = "comm_info_request";
    pub const COMM_INFO_REPLY: &str = "comm_info_reply";
    pub const COMM_OPEN: &str = "comm_open";
    pub const COMM_MSG: &str = "comm_msg";
    pub const COMM_CLOSE: &str = "comm_close";
    pub const INTERRUPT_REQUEST: &str = "interrupt_request";
    pub const INTERRUPT_REPLY: &str = "interrupt_reply";
    pub const SHUTDOWN_REQUEST: &str = "shutdown_request";
    pub const SHUTDOWN_REPLY: &str = "shutdown_reply";
    pub const INPUT_REQUEST: &str = "input_request";
    pub const INPUT_REPLY: &str = "input_reply";
    /// Reply to requests the kernel does not handle.
    pub const NONE: &str = "none";
}

/// Logical message path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Control,
    Shell,
    Stdin,
    /// Broadcast channel for status, streams and display output.
    #[serde(rename = "iopub", alias = "event")]
    Event,
}

/// Current timestamp in RFC 3339.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Header {
    /// Fresh header with a new message id and the current time.
    pub fn new(
        msg_type: impl Into<String>,
        session: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: session.into(),
            username: username.into(),
            date: now_timestamp(),
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Serializes `None` as `{}` and reads `{}` back as `None`.
mod parent_header {
    use super::*;

    pub fn serialize<S: Serializer>(header: &Option<Header>, s: S) -> Result<S::Ok, S::Error> {
        match header {
            Some(header) => header.serialize(s),
            None => Map::new().serialize(s),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Header>, D::Error> {
        let value = Value::deserialize(d)?;
        match &value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            _ => serde_json::from_value(value)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: Channel,
    pub header: Header,
    #[serde(default, with = "parent_header")]
    pub parent_header: Option<Header>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub content: Value,
}

impl Message {
    /// A request-style message, mostly useful for clients and tests.
    pub fn request(channel: Channel, msg_type: &str, session: &str, content: Value) -> Self {
        Self {
            channel,
            header: Header::new(msg_type, session, "user"),
            parent_header: None,
            metadata: Map::new(),
            content,
        }
    }

    /// A message answering `parent`. Session and username are copied from it.
    pub fn reply_to(parent: &Header, channel: Channel, msg_type: &str, content: Value) -> Self {
        Self {
            channel,
            header: Header::new(msg_type, parent.session.clone(), parent.username.clone()),
            parent_header: Some(parent.clone()),
            metadata: Map::new(),
            content,
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Id of the request this message answers.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

// --- request content ---

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default = "default_true")]
    pub store_history: bool,
    #[serde(default)]
    pub user_expressions: Map<String, Value>,
    #[serde(default = "default_true")]
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub stop_on_error: bool,
}

impl ExecuteRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            silent: false,
            store_history: true,
            user_expressions: Map::new(),
            allow_stdin: true,
            stop_on_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub code: String,
    pub cursor_pos: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommInfoRequest {
    #[serde(default)]
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommOpen {
    pub comm_id: String,
    pub target_name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommMsg {
    pub comm_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    #[serde(default)]
    pub restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputReply {
    pub value: String,
}

/// Every request kind the kernel understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    KernelInfo,
    Execute(ExecuteRequest),
    Complete(CompleteRequest),
    ListErrors(CodeRequest),
    IsComplete(CodeRequest),
    History,
    Connect,
    CommInfo(CommInfoRequest),
    CommOpen(CommOpen),
    CommMsg(CommMsg),
    CommClose(CommMsg),
    Interrupt,
    Shutdown(ShutdownRequest),
    InputReply(InputReply),
    /// A message type the kernel does not know.
    Unknown(String),
}

impl Request {
    /// Decode the content of `message` according to its type.
    ///
    /// Unknown types decode to [`Request::Unknown`]; malformed content for a
    /// known type is an error.
    pub fn decode(message: &Message) -> Result<Self, serde_json::Error> {
        fn content<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T, serde_json::Error> {
            let value = match &message.content {
                Value::Null => Value::Object(Map::new()),
                other => other.clone(),
            };
            serde_json::from_value(value)
        }

        let request = match message.msg_type() {
            msg_type::KERNEL_INFO_REQUEST => Self::KernelInfo,
            msg_type::EXECUTE_REQUEST => Self::Execute(content(message)?),
            msg_type::COMPLETE_REQUEST => Self::Complete(content(message)?),
            msg_type::LIST_ERRORS_REQUEST => Self::ListErrors(content(message)?),
            msg_type::IS_COMPLETE_REQUEST => Self::IsComplete(content(message)?),
            msg_type::HISTORY_REQUEST => Self::History,
            msg_type::CONNECT_REQUEST => Self::Connect,
            msg_type::COMM_INFO_REQUEST => Self::CommInfo(content(message)?),
            msg_type::COMM_OPEN => Self::CommOpen(content(message)?),
            msg_type::COMM_MSG => Self::CommMsg(content(message)?),
            msg_type::COMM_CLOSE => Self::CommClose(content(message)?),
            msg_type::INTERRUPT_REQUEST => Self::Interrupt,
            msg_type::SHUTDOWN_REQUEST => Self::Shutdown(content(message)?),
            msg_type::INPUT_REPLY => Self::InputReply(content(message)?),
            other => Self::Unknown(other.to_string()),
        };
        Ok(request)
    }
}

// --- reply and event content ---

/// Reply status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusContent {
    pub execution_state: ExecutionState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamContent {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteInput {
    pub code: String,
    pub execution_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub execution_count: u64,
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContent {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub status: ReplyStatus,
    pub execution_count: u64,
    #[serde(flatten)]
    pub error: Option<ErrorContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_expressions: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDataContent {
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub transient: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfoReply {
    pub status: ReplyStatus,
    pub protocol_version: String,
    pub implementation: String,
    pub implementation_version: String,
    pub banner: String,
    pub language_info: LanguageInfo,
    pub help_links: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteReply {
    pub status: ReplyStatus,
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListErrorsReply {
    pub code: String,
    pub errors: Vec<Diagnostic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsCompleteReply {
    #[serde(flatten)]
    pub status: CompletenessStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryReply {
    pub status: ReplyStatus,
    pub history: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommTargetInfo {
    pub target_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommInfoReply {
    pub status: ReplyStatus,
    pub comms: FxHashMap<String, CommTargetInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub prompt: String,
    pub password: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_parent_header_round_trip() {
        let msg = Message::request(Channel::Shell, msg_type::KERNEL_INFO_REQUEST, "s", json!({}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["parent_header"], json!({}));
        assert_eq!(json["channel"], "shell");

        let back: Message = serde_json::from_value(json).unwrap();
        assert!(back.parent_header.is_none());
    }

    #[test]
    fn test_reply_copies_session() {
        let request = Message::request(Channel::Shell, msg_type::EXECUTE_REQUEST, "sess-1", json!({}));
        let reply = Message::reply_to(&request.header, Channel::Shell, msg_type::EXECUTE_REPLY, json!({}));
        assert_eq!(reply.header.session, "sess-1");
        assert_eq!(reply.header.username, "user");
        assert_eq!(reply.parent_id(), Some(request.header.msg_id.as_str()));
        assert_ne!(reply.header.msg_id, request.header.msg_id);
        assert_eq!(reply.header.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_event_channel_name() {
        assert_eq!(serde_json::to_value(Channel::Event).unwrap(), "iopub");
        let channel: Channel = serde_json::from_value(json!("event")).unwrap();
        assert_eq!(channel, Channel::Event);
    }

    #[test]
    fn test_decode_execute_defaults() {
        let msg = Message::request(
            Channel::Shell,
            msg_type::EXECUTE_REQUEST,
            "s",
            json!({"code": "1+1"}),
        );
        match Request::decode(&msg).unwrap() {
            Request::Execute(req) => {
                assert_eq!(req.code, "1+1");
                assert!(req.store_history);
                assert!(req.allow_stdin);
                assert!(!req.silent);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_and_malformed() {
        let msg = Message::request(Channel::Shell, "inspect_request", "s", json!({}));
        assert_eq!(
            Request::decode(&msg).unwrap(),
            Request::Unknown("inspect_request".to_string())
        );

        let msg = Message::request(Channel::Shell, msg_type::EXECUTE_REQUEST, "s", json!({"code": 5}));
        assert!(Request::decode(&msg).is_err());
    }

    #[test]
    fn test_execute_reply_error_is_flattened() {
        let reply = ExecuteReply {
            status: ReplyStatus::Error,
            execution_count: 3,
            error: Some(ErrorContent {
                ename: "DivisionByZero".into(),
                evalue: "division by zero".into(),
                traceback: vec![],
            }),
            payload: None,
            user_expressions: None,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["ename"], "DivisionByZero");
        assert!(json.get("payload").is_none());
    }
}

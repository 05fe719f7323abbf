//! Jupyter messages as they travel over the kernel channels WebSocket.
//!
//! Inbound frames are first parsed into [`RawKernelMessage`] (content kept as
//! raw JSON), then converted into a typed [`KernelMessage`] based on
//! `header.msg_type`. Only the message types a session consumes are accepted;
//! everything else is a protocol error the caller may log and skip.

use chrono::{SecondsFormat, Utc};
use jupyter_protocol::{
    ClearOutput, DisplayData, ErrorOutput, ExecuteInput, ExecuteRequest, ExecuteResult,
    InputRequest, JupyterMessageContent, Status, StreamContent,
};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{KernelError, Result};

/// Jupyter messaging protocol version sent in outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Message header. Every field is optional on the way in so minimal frames
/// from proxies still decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireHeader {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default)]
    pub version: String,
}

impl WireHeader {
    fn new(msg_type: &str, session: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.to_string(),
            session: session.to_string(),
            username: "runcell".to_string(),
            date: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// `parent_header` may be missing, `null`, `{}` or a header.
fn deserialize_parent_header<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<WireHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => serde_json::from_value(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// An inbound frame with its content still untyped.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKernelMessage {
    pub header: WireHeader,

    #[serde(default, deserialize_with = "deserialize_parent_header")]
    pub parent_header: Option<WireHeader>,

    #[serde(default)]
    pub metadata: Value,

    /// Raw JSON content, parsed later based on `header.msg_type`.
    #[serde(default)]
    pub content: Value,

    /// `shell`, `iopub`, `stdin` or `control`.
    #[serde(default)]
    pub channel: Option<String>,
}

impl RawKernelMessage {
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header
            .as_ref()
            .map(|h| h.msg_id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn is_stdin(&self) -> bool {
        self.channel.as_deref() == Some("stdin")
    }
}

/// Content of an `execute_reply`. Only the outcome matters for routing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExecuteReplyContent {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub execution_count: Option<u64>,
}

impl ExecuteReplyContent {
    /// A reply without a status is treated as success.
    pub fn is_ok(&self) -> bool {
        matches!(self.status.as_deref(), None | Some("ok"))
    }
}

/// Typed message content, one variant per consumed `msg_type`.
#[derive(Debug, Clone)]
pub enum KernelContent {
    ExecuteReply(ExecuteReplyContent),
    Stream(StreamContent),
    DisplayData(DisplayData),
    ExecuteResult(ExecuteResult),
    Error(ErrorOutput),
    Status(Status),
    ExecuteInput(ExecuteInput),
    ClearOutput(ClearOutput),
    InputRequest(InputRequest),
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub struct KernelMessage {
    pub msg_type: String,
    pub msg_id: String,
    pub parent_msg_id: Option<String>,
    pub content: KernelContent,
}

impl TryFrom<RawKernelMessage> for KernelMessage {
    type Error = KernelError;

    fn try_from(raw: RawKernelMessage) -> Result<Self> {
        let parent_msg_id = raw.parent_msg_id().map(String::from);
        let msg_type = raw.header.msg_type;
        let mut content = raw.content;
        if content.is_null() {
            content = Value::Object(Default::default());
        }

        let content = match msg_type.as_str() {
            "execute_reply" => KernelContent::ExecuteReply(serde_json::from_value(content)?),
            "stream" | "display_data" | "execute_result" | "error" | "status"
            | "execute_input" | "clear_output" | "input_request" => {
                let parsed = JupyterMessageContent::from_type_and_content(&msg_type, content)
                    .map_err(|e| {
                        KernelError::Protocol(format!("malformed {} content: {}", msg_type, e))
                    })?;
                match parsed {
                    JupyterMessageContent::StreamContent(c) => KernelContent::Stream(c),
                    JupyterMessageContent::DisplayData(c) => KernelContent::DisplayData(c),
                    JupyterMessageContent::ExecuteResult(c) => KernelContent::ExecuteResult(c),
                    JupyterMessageContent::ErrorOutput(c) => KernelContent::Error(c),
                    JupyterMessageContent::Status(c) => KernelContent::Status(c),
                    JupyterMessageContent::ExecuteInput(c) => KernelContent::ExecuteInput(c),
                    JupyterMessageContent::ClearOutput(c) => KernelContent::ClearOutput(c),
                    JupyterMessageContent::InputRequest(c) => KernelContent::InputRequest(c),
                    other => {
                        return Err(KernelError::Protocol(format!(
                            "{} decoded as unexpected content {:?}",
                            msg_type, other
                        )))
                    }
                }
            }
            other => {
                return Err(KernelError::Protocol(format!(
                    "unsupported message type: {}",
                    other
                )))
            }
        };

        Ok(KernelMessage {
            msg_type,
            msg_id: raw.header.msg_id,
            parent_msg_id,
            content,
        })
    }
}

impl KernelMessage {
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawKernelMessage = serde_json::from_value(value)?;
        raw.try_into()
    }
}

/// An envelope ready to be written to the channels socket.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub header: WireHeader,
    pub parent_header: WireHeader,
    pub metadata: Value,
    pub content: Value,
    pub channel: String,
}

impl OutgoingMessage {
    /// An `execute_request` whose parent header repeats its own header.
    pub fn execute_request(code: &str, session: &str) -> Result<Self> {
        let header = WireHeader::new("execute_request", session);
        let mut content = serde_json::to_value(ExecuteRequest::new(code.to_string()))?;
        content["code"] = Value::String(code.to_string());
        content["silent"] = Value::Bool(false);
        content["allow_stdin"] = Value::Bool(true);

        Ok(Self {
            parent_header: header.clone(),
            header,
            metadata: Value::Object(Default::default()),
            content,
            channel: "shell".to_string(),
        })
    }

    /// Answer to an `input_request`, sent on the stdin channel.
    pub fn input_reply(value: &str, session: &str) -> Self {
        let header = WireHeader::new("input_reply", session);
        Self {
            parent_header: header.clone(),
            header,
            metadata: Value::Object(Default::default()),
            content: serde_json::json!({ "value": value, "status": "ok" }),
            channel: "stdin".to_string(),
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

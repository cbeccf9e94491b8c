//! Message envelope codec
//!
//! Defines the wire shape exchanged with the sandboxed guest: a `type`
//! discriminator from a closed set, a per-type `payload`, and optional
//! `requestId` / `messageId` correlation fields.
//!
//! Decoding validates at the boundary so the rest of the bridge can trust
//! the typed [`Message`] it receives.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Which side of the boundary may send a message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    GuestToHost,
    HostToGuest,
    Both,
}

/// Closed set of wire discriminators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ReadySignal,
    RenderData,
    RenderDataRequest,
    PromptRequest,
    PromptResponse,
    ToolCallRequest,
    ToolCallResponse,
    ResourceReadRequest,
    ResourceReadResponse,
    LinkOpenRequest,
    LinkOpenResponse,
    GenericMessage,
    GenericMessageResponse,
    GuestResponse,
    MessageReceived,
    SizeChange,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 17] = [
        MessageType::ReadySignal,
        MessageType::RenderData,
        MessageType::RenderDataRequest,
        MessageType::PromptRequest,
        MessageType::PromptResponse,
        MessageType::ToolCallRequest,
        MessageType::ToolCallResponse,
        MessageType::ResourceReadRequest,
        MessageType::ResourceReadResponse,
        MessageType::LinkOpenRequest,
        MessageType::LinkOpenResponse,
        MessageType::GenericMessage,
        MessageType::GenericMessageResponse,
        MessageType::GuestResponse,
        MessageType::MessageReceived,
        MessageType::SizeChange,
        MessageType::Error,
    ];

    /// Wire value of the discriminator
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ReadySignal => "ready-signal",
            MessageType::RenderData => "render-data",
            MessageType::RenderDataRequest => "render-data-request",
            MessageType::PromptRequest => "prompt-request",
            MessageType::PromptResponse => "prompt-response",
            MessageType::ToolCallRequest => "tool-call-request",
            MessageType::ToolCallResponse => "tool-call-response",
            MessageType::ResourceReadRequest => "resource-read-request",
            MessageType::ResourceReadResponse => "resource-read-response",
            MessageType::LinkOpenRequest => "link-open-request",
            MessageType::LinkOpenResponse => "link-open-response",
            MessageType::GenericMessage => "generic-message",
            MessageType::GenericMessageResponse => "generic-message-response",
            MessageType::GuestResponse => "guest-response",
            MessageType::MessageReceived => "message-received",
            MessageType::SizeChange => "size-change",
            MessageType::Error => "error",
        }
    }

    /// Parse a wire discriminator. Unknown values return `None`.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == value)
    }

    pub fn direction(&self) -> Direction {
        match self {
            MessageType::ReadySignal
            | MessageType::RenderDataRequest
            | MessageType::PromptRequest
            | MessageType::ToolCallRequest
            | MessageType::ResourceReadRequest
            | MessageType::LinkOpenRequest
            | MessageType::GenericMessage
            | MessageType::GuestResponse
            | MessageType::SizeChange => Direction::GuestToHost,
            MessageType::RenderData
            | MessageType::PromptResponse
            | MessageType::ToolCallResponse
            | MessageType::ResourceReadResponse
            | MessageType::LinkOpenResponse
            | MessageType::GenericMessageResponse => Direction::HostToGuest,
            MessageType::MessageReceived | MessageType::Error => Direction::Both,
        }
    }

    /// Whether the host may send this type to the guest
    pub fn host_may_send(&self) -> bool {
        matches!(self.direction(), Direction::HostToGuest | Direction::Both)
    }

    /// Whether the envelope must carry a `payload`
    pub fn requires_payload(&self) -> bool {
        !matches!(
            self,
            MessageType::ReadySignal | MessageType::RenderDataRequest | MessageType::MessageReceived
        )
    }

    /// Response type for guest-initiated requests
    pub fn response_type(&self) -> Option<MessageType> {
        match self {
            MessageType::PromptRequest => Some(MessageType::PromptResponse),
            MessageType::ToolCallRequest => Some(MessageType::ToolCallResponse),
            MessageType::ResourceReadRequest => Some(MessageType::ResourceReadResponse),
            MessageType::LinkOpenRequest => Some(MessageType::LinkOpenResponse),
            MessageType::GenericMessage => Some(MessageType::GenericMessageResponse),
            _ => None,
        }
    }

    /// Guest-initiated request handled by a capability handler
    pub fn is_request(&self) -> bool {
        self.response_type().is_some()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest -> Host: send a prompt into the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
}

/// Guest -> Host: invoke a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    pub tool_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Guest -> Host: read a resource by URI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReadRequest {
    pub uri: String,
}

/// Guest -> Host: open a URL outside the sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkOpenRequest {
    pub url: String,
}

impl LinkOpenRequest {
    /// Parse the requested URL
    pub fn parsed_url(&self) -> Result<url::Url, url::ParseError> {
        url::Url::parse(&self.url)
    }
}

/// Host -> Guest: outcome of a link-open request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOpenResult {
    pub is_error: bool,
}

/// Guest -> Host: rendered content size changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Payload of an `error` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
    pub code: i64,
}

/// Typed message, one variant per wire discriminator
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ReadySignal,
    RenderData(Value),
    RenderDataRequest,
    PromptRequest(PromptRequest),
    PromptResponse(Value),
    ToolCallRequest(ToolCallRequest),
    ToolCallResponse(Value),
    ResourceReadRequest(ResourceReadRequest),
    ResourceReadResponse(Value),
    LinkOpenRequest(LinkOpenRequest),
    LinkOpenResponse(LinkOpenResult),
    GenericMessage(Value),
    GenericMessageResponse(Value),
    GuestResponse(Value),
    MessageReceived,
    SizeChange(SizeChange),
    Error(ErrorPayload),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ReadySignal => MessageType::ReadySignal,
            Message::RenderData(_) => MessageType::RenderData,
            Message::RenderDataRequest => MessageType::RenderDataRequest,
            Message::PromptRequest(_) => MessageType::PromptRequest,
            Message::PromptResponse(_) => MessageType::PromptResponse,
            Message::ToolCallRequest(_) => MessageType::ToolCallRequest,
            Message::ToolCallResponse(_) => MessageType::ToolCallResponse,
            Message::ResourceReadRequest(_) => MessageType::ResourceReadRequest,
            Message::ResourceReadResponse(_) => MessageType::ResourceReadResponse,
            Message::LinkOpenRequest(_) => MessageType::LinkOpenRequest,
            Message::LinkOpenResponse(_) => MessageType::LinkOpenResponse,
            Message::GenericMessage(_) => MessageType::GenericMessage,
            Message::GenericMessageResponse(_) => MessageType::GenericMessageResponse,
            Message::GuestResponse(_) => MessageType::GuestResponse,
            Message::MessageReceived => MessageType::MessageReceived,
            Message::SizeChange(_) => MessageType::SizeChange,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Build a message from a discriminator and an untyped payload
    pub fn from_parts(
        message_type: MessageType,
        payload: Option<Value>,
    ) -> Result<Self, DecodeError> {
        let payload = match payload {
            Some(payload) => payload,
            None if message_type.requires_payload() => {
                return Err(DecodeError::MissingPayload(message_type))
            }
            None => Value::Null,
        };

        let message = match message_type {
            MessageType::ReadySignal => Message::ReadySignal,
            MessageType::RenderDataRequest => Message::RenderDataRequest,
            MessageType::MessageReceived => Message::MessageReceived,
            MessageType::RenderData => Message::RenderData(payload),
            MessageType::PromptResponse => Message::PromptResponse(payload),
            MessageType::ToolCallResponse => Message::ToolCallResponse(payload),
            MessageType::ResourceReadResponse => Message::ResourceReadResponse(payload),
            MessageType::GenericMessage => Message::GenericMessage(payload),
            MessageType::GenericMessageResponse => Message::GenericMessageResponse(payload),
            MessageType::GuestResponse => Message::GuestResponse(payload),
            MessageType::PromptRequest => Message::PromptRequest(typed(message_type, payload)?),
            MessageType::ToolCallRequest => {
                Message::ToolCallRequest(typed(message_type, payload)?)
            }
            MessageType::ResourceReadRequest => {
                Message::ResourceReadRequest(typed(message_type, payload)?)
            }
            MessageType::LinkOpenRequest => {
                Message::LinkOpenRequest(typed(message_type, payload)?)
            }
            MessageType::LinkOpenResponse => {
                Message::LinkOpenResponse(typed(message_type, payload)?)
            }
            MessageType::SizeChange => Message::SizeChange(typed(message_type, payload)?),
            MessageType::Error => {
                let error: ErrorPayload = typed(message_type, payload)?;
                if error.request_id.as_deref() == Some("") {
                    return Err(DecodeError::InvalidId("payload.requestId"));
                }
                Message::Error(error)
            }
        };
        Ok(message)
    }

    /// Untyped payload for the wire, `None` for payload-less types
    pub fn payload(&self) -> Option<Value> {
        match self {
            Message::ReadySignal | Message::RenderDataRequest | Message::MessageReceived => None,
            Message::RenderData(v)
            | Message::PromptResponse(v)
            | Message::ToolCallResponse(v)
            | Message::ResourceReadResponse(v)
            | Message::GenericMessage(v)
            | Message::GenericMessageResponse(v)
            | Message::GuestResponse(v) => Some(v.clone()),
            Message::PromptRequest(p) => Some(json!({ "prompt": p.prompt })),
            Message::ToolCallRequest(t) => Some(json!({
                "toolName": t.tool_name,
                "params": Value::Object(t.params.clone()),
            })),
            Message::ResourceReadRequest(r) => Some(json!({ "uri": r.uri })),
            Message::LinkOpenRequest(l) => Some(json!({ "url": l.url })),
            Message::LinkOpenResponse(r) => Some(json!({ "isError": r.is_error })),
            Message::SizeChange(s) => {
                let mut map = Map::new();
                if let Some(width) = s.width {
                    map.insert("width".to_string(), json!(width));
                }
                if let Some(height) = s.height {
                    map.insert("height".to_string(), json!(height));
                }
                Some(Value::Object(map))
            }
            Message::Error(e) => {
                let mut map = Map::new();
                if let Some(id) = &e.request_id {
                    map.insert("requestId".to_string(), json!(id));
                }
                map.insert("message".to_string(), json!(e.message));
                map.insert("code".to_string(), json!(e.code));
                Some(Value::Object(map))
            }
        }
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    message_type: MessageType,
    payload: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(payload).map_err(|e| DecodeError::InvalidPayload {
        message_type,
        reason: e.to_string(),
    })
}

/// Reason an inbound message was rejected by the codec
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing `type` field")]
    MissingType,

    #[error("`type` must be a string")]
    TypeNotString,

    #[error("unknown message type `{0}`")]
    UnknownType(String),

    #[error("`{0}` must be a non-empty string")]
    InvalidId(&'static str),

    #[error("message type {0} requires a payload")]
    MissingPayload(MessageType),

    #[error("message type {0} requires a requestId")]
    MissingRequestId(MessageType),

    #[error("invalid payload for {message_type}: {reason}")]
    InvalidPayload {
        message_type: MessageType,
        reason: String,
    },
}

/// A validated message plus its correlation fields
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub request_id: Option<String>,
    pub message_id: Option<String>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            request_id: None,
            message_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Build an `error` envelope addressed to `request_id`
    pub fn error(request_id: Option<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            message: Message::Error(ErrorPayload {
                request_id: request_id.clone(),
                message: message.into(),
                code,
            }),
            request_id,
            message_id: None,
        }
    }
}

/// Encode an envelope into its wire representation
pub fn encode(envelope: &Envelope) -> Value {
    let mut map = Map::new();
    map.insert(
        "type".to_string(),
        Value::String(envelope.message_type().as_str().to_string()),
    );
    if let Some(payload) = envelope.message.payload() {
        map.insert("payload".to_string(), payload);
    }
    if let Some(id) = &envelope.request_id {
        map.insert("requestId".to_string(), Value::String(id.clone()));
    }
    if let Some(id) = &envelope.message_id {
        map.insert("messageId".to_string(), Value::String(id.clone()));
    }
    Value::Object(map)
}

/// Decode and validate a wire message
pub fn decode(raw: &Value) -> Result<Envelope, DecodeError> {
    let obj = raw.as_object().ok_or(DecodeError::NotAnObject)?;

    let type_value = obj.get("type").ok_or(DecodeError::MissingType)?;
    let type_str = type_value.as_str().ok_or(DecodeError::TypeNotString)?;
    let message_type = MessageType::from_wire(type_str)
        .ok_or_else(|| DecodeError::UnknownType(type_str.to_string()))?;

    let request_id = optional_id(obj, "requestId")?;
    let message_id = optional_id(obj, "messageId")?;

    if message_type == MessageType::GuestResponse && request_id.is_none() {
        return Err(DecodeError::MissingRequestId(message_type));
    }

    let message = Message::from_parts(message_type, obj.get("payload").cloned())?;

    Ok(Envelope {
        message,
        request_id,
        message_id,
    })
}

/// Decode a message delivered as a JSON string
pub fn decode_str(raw: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    decode(&value)
}

/// Recover a well-formed `requestId` from a message that failed to decode
pub fn request_id_hint(raw: &Value) -> Option<String> {
    raw.get("requestId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn optional_id(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if !id.is_empty() => Ok(Some(id.clone())),
        Some(_) => Err(DecodeError::InvalidId(field)),
    }
}

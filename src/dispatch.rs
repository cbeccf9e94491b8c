//! Capability dispatch
//!
//! Maps guest requests onto host capabilities and turns the outcome back
//! into a response envelope addressed to the guest's `requestId`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use crate::envelope::{
    Envelope, LinkOpenRequest, LinkOpenResult, Message, MessageType, PromptRequest,
    ResourceReadRequest, SizeChange, ToolCallRequest,
};
use crate::error::{codes, Error, Result};

/// Host capabilities exposed to the guest.
///
/// Every operation is optional: the default bodies answer with
/// [`Error::Unsupported`], which reaches the guest as an error envelope.
#[async_trait]
pub trait CapabilityHandlers: Send + Sync {
    /// Invoke a tool on behalf of the guest
    async fn call_tool(&self, _request: ToolCallRequest) -> Result<Value> {
        Err(Error::Unsupported(MessageType::ToolCallRequest))
    }

    /// Read a resource by URI
    async fn read_resource(&self, _request: ResourceReadRequest) -> Result<Value> {
        Err(Error::Unsupported(MessageType::ResourceReadRequest))
    }

    /// Open a link outside the sandbox
    async fn open_link(&self, _request: LinkOpenRequest) -> Result<LinkOpenResult> {
        Err(Error::Unsupported(MessageType::LinkOpenRequest))
    }

    /// Send a prompt into the conversation
    async fn send_prompt(&self, _request: PromptRequest) -> Result<Value> {
        Err(Error::Unsupported(MessageType::PromptRequest))
    }

    /// Host-defined handling of a generic message
    async fn on_message(&self, _payload: Value) -> Result<Value> {
        Err(Error::Unsupported(MessageType::GenericMessage))
    }

    /// Guest content resized. Notification only.
    async fn on_size_change(&self, _size: SizeChange) {}
}

/// Handler set with no capabilities bound
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCapabilities;

impl CapabilityHandlers for NoCapabilities {}

type Handler<T, R> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Closure-backed [`CapabilityHandlers`]
///
/// # Example
/// ```rust
/// use reson_ui::dispatch::HandlerSet;
/// use serde_json::json;
///
/// let handlers = HandlerSet::new().on_tool_call(|request| {
///     Box::pin(async move {
///         Ok(json!({"content": [{"type": "text", "text": request.tool_name}]}))
///     })
/// });
/// ```
#[derive(Clone, Default)]
pub struct HandlerSet {
    tool_call: Option<Handler<ToolCallRequest, Value>>,
    resource_read: Option<Handler<ResourceReadRequest, Value>>,
    link_open: Option<Handler<LinkOpenRequest, LinkOpenResult>>,
    prompt: Option<Handler<PromptRequest, Value>>,
    message: Option<Handler<Value, Value>>,
    size_change: Option<Arc<dyn Fn(SizeChange) + Send + Sync>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tool_call<F>(mut self, handler: F) -> Self
    where
        F: Fn(ToolCallRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.tool_call = Some(Arc::new(handler));
        self
    }

    pub fn on_resource_read<F>(mut self, handler: F) -> Self
    where
        F: Fn(ResourceReadRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.resource_read = Some(Arc::new(handler));
        self
    }

    pub fn on_link_open<F>(mut self, handler: F) -> Self
    where
        F: Fn(LinkOpenRequest) -> BoxFuture<'static, Result<LinkOpenResult>>
            + Send
            + Sync
            + 'static,
    {
        self.link_open = Some(Arc::new(handler));
        self
    }

    pub fn on_prompt<F>(mut self, handler: F) -> Self
    where
        F: Fn(PromptRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.prompt = Some(Arc::new(handler));
        self
    }

    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync + 'static,
    {
        self.message = Some(Arc::new(handler));
        self
    }

    pub fn on_size_change<F>(mut self, handler: F) -> Self
    where
        F: Fn(SizeChange) + Send + Sync + 'static,
    {
        self.size_change = Some(Arc::new(handler));
        self
    }
}

#[async_trait]
impl CapabilityHandlers for HandlerSet {
    async fn call_tool(&self, request: ToolCallRequest) -> Result<Value> {
        match &self.tool_call {
            Some(handler) => handler(request).await,
            None => Err(Error::Unsupported(MessageType::ToolCallRequest)),
        }
    }

    async fn read_resource(&self, request: ResourceReadRequest) -> Result<Value> {
        match &self.resource_read {
            Some(handler) => handler(request).await,
            None => Err(Error::Unsupported(MessageType::ResourceReadRequest)),
        }
    }

    async fn open_link(&self, request: LinkOpenRequest) -> Result<LinkOpenResult> {
        match &self.link_open {
            Some(handler) => handler(request).await,
            None => Err(Error::Unsupported(MessageType::LinkOpenRequest)),
        }
    }

    async fn send_prompt(&self, request: PromptRequest) -> Result<Value> {
        match &self.prompt {
            Some(handler) => handler(request).await,
            None => Err(Error::Unsupported(MessageType::PromptRequest)),
        }
    }

    async fn on_message(&self, payload: Value) -> Result<Value> {
        match &self.message {
            Some(handler) => handler(payload).await,
            None => Err(Error::Unsupported(MessageType::GenericMessage)),
        }
    }

    async fn on_size_change(&self, size: SizeChange) {
        if let Some(handler) = &self.size_change {
            handler(size);
        }
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("tool_call", &self.tool_call.is_some())
            .field("resource_read", &self.resource_read.is_some())
            .field("link_open", &self.link_open.is_some())
            .field("prompt", &self.prompt.is_some())
            .field("message", &self.message.is_some())
            .field("size_change", &self.size_change.is_some())
            .finish()
    }
}

/// Routes decoded guest messages to capability handlers
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<dyn CapabilityHandlers>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<dyn CapabilityHandlers>) -> Self {
        Self { handlers }
    }

    /// Handle one guest message.
    ///
    /// Returns the envelope to send back, or `None` when the guest expects no
    /// reply (no `requestId`, or a notification).
    pub async fn dispatch(&self, envelope: Envelope) -> Option<Envelope> {
        let message_type = envelope.message_type();
        let request_id = envelope.request_id;

        let Some(response_type) = message_type.response_type() else {
            if let Message::SizeChange(size) = envelope.message {
                self.handlers.on_size_change(size).await;
                return None;
            }
            tracing::warn!(message_type = %message_type, "message type is not dispatchable");
            return request_id.map(|id| {
                Envelope::error(
                    Some(id),
                    codes::UNSUPPORTED,
                    format!("unsupported operation: {}", message_type),
                )
            });
        };

        let outcome = AssertUnwindSafe(self.invoke(envelope.message))
            .catch_unwind()
            .await;

        let response = match outcome {
            Ok(Ok(value)) => match Message::from_parts(response_type, Some(value)) {
                Ok(message) => Envelope::new(message),
                Err(e) => {
                    tracing::warn!(message_type = %message_type, error = %e, "handler returned a malformed result");
                    Envelope::error(None, codes::INTERNAL, e.to_string())
                }
            },
            Ok(Err(e)) => {
                tracing::debug!(message_type = %message_type, error = %e, "capability handler failed");
                Envelope::error(None, e.code(), e.to_string())
            }
            Err(_) => {
                tracing::warn!(message_type = %message_type, "capability handler panicked");
                Envelope::error(None, codes::INTERNAL, "capability handler panicked")
            }
        };

        let request_id = request_id?;
        Some(address(response, request_id))
    }

    async fn invoke(&self, message: Message) -> Result<Value> {
        match message {
            Message::ToolCallRequest(request) => self.handlers.call_tool(request).await,
            Message::ResourceReadRequest(request) => self.handlers.read_resource(request).await,
            Message::LinkOpenRequest(request) => self
                .handlers
                .open_link(request)
                .await
                .map(|result| json!({ "isError": result.is_error })),
            Message::PromptRequest(request) => self.handlers.send_prompt(request).await,
            Message::GenericMessage(payload) => self.handlers.on_message(payload).await,
            other => Err(Error::Unsupported(other.message_type())),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

fn address(mut envelope: Envelope, request_id: String) -> Envelope {
    if let Message::Error(payload) = &mut envelope.message {
        payload.request_id = Some(request_id.clone());
    }
    envelope.with_request_id(request_id)
}

//! Bridge composition root
//!
//! Wires the surface controller, codec, lifecycle, correlation registry and
//! dispatcher into one session per mounted surface.
//!
//! Inbound guest messages flow through a bounded queue drained by a single
//! consumer task: decode -> lifecycle gate -> lifecycle / registry /
//! dispatcher. Each capability dispatch runs as its own task, so slow
//! handlers never hold up unrelated messages and replies may complete out of
//! order.
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use reson_ui::bridge::{Bridge, BridgeConfig, SurfaceTarget};
//! use reson_ui::dispatch::HandlerSet;
//! use reson_ui::transport::MemoryRuntime;
//! use serde_json::json;
//!
//! # async fn example() -> reson_ui::Result<()> {
//! let handlers = HandlerSet::new().on_tool_call(|request| {
//!     Box::pin(async move { Ok(json!({"content": [{"type": "text", "text": request.tool_name}]})) })
//! });
//! let bridge = Bridge::new(MemoryRuntime::new(), Arc::new(handlers));
//! let handle = bridge.mount(
//!     BridgeConfig::new(SurfaceTarget::RawHtml("<button>Run</button>".into()))
//!         .with_initial_render_data(json!({"rows": []})),
//! )?;
//! handle.ready().await?;
//! handle.dispose();
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;
use uuid::Uuid;

use crate::correlation::{CorrelationRegistry, PendingReply, RequestIdSequence};
use crate::dispatch::{CapabilityHandlers, Dispatcher};
use crate::envelope::{self, DecodeError, Direction, Envelope, Message, MessageType};
use crate::error::{codes, Error, Result};
use crate::lifecycle::{Lifecycle, Outbound, Phase};
use crate::resource::{ResourceDescriptor, SurfaceContent};
use crate::surface::{FrameSpec, SandboxPolicy, SurfaceController, SurfaceRuntime};
use crate::transport::SourceId;

/// Default deadline for host -> guest requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of messages held while waiting for the guest
pub const DEFAULT_MAX_BUFFERED_MESSAGES: usize = 256;

/// Default capacity of the inbound queue
pub const DEFAULT_INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Host-visible, non-fatal events. Never forwarded to the guest.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Guest message failed envelope validation and was dropped
    Malformed { error: DecodeError },
    /// Message from an unexpected source or origin was dropped
    RejectedSource { source: SourceId, origin: String },
    /// Inbound queue was full and a guest message was dropped
    QueueOverflow,
    /// Guest replied to a request that is not pending (late or unknown)
    UnmatchedReply { request_id: String },
    /// Guest reused a `requestId` that is still in flight
    DuplicateRequest { request_id: String },
    /// Guest sent a type only the host may send
    WrongDirection { message_type: MessageType },
    /// A capability request was answered with an error envelope
    HandlerFailed {
        message_type: MessageType,
        request_id: Option<String>,
        message: String,
    },
    /// Posting to the guest failed
    SendFailed { error: String },
    /// The surface failed to load
    LoadFailed { reason: String },
}

/// Callback receiving [`Diagnostic`]s
pub type DiagnosticSink = Arc<dyn Fn(Diagnostic) + Send + Sync>;

/// What to render. Resource content and pre-fetched raw content are
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceTarget {
    /// A resource descriptor resolved by its MIME type
    Resource(ResourceDescriptor),
    /// Pre-fetched markup
    RawHtml(String),
    /// External page
    Url(Url),
}

impl SurfaceTarget {
    fn into_content(self) -> Result<SurfaceContent> {
        match self {
            SurfaceTarget::Resource(descriptor) => SurfaceContent::from_descriptor(&descriptor),
            SurfaceTarget::RawHtml(html) => Ok(SurfaceContent::Html(html)),
            SurfaceTarget::Url(url) => Ok(SurfaceContent::Url(url)),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Content to render
    pub target: SurfaceTarget,

    /// Deadline for host -> guest requests without an explicit timeout
    pub request_timeout: Duration,

    /// Sandbox attribute set for the rendering context
    pub sandbox: SandboxPolicy,

    /// Messages held before the guest signals ready
    pub max_buffered_messages: usize,

    /// Guest messages queued for processing before new ones are dropped
    pub inbound_queue_capacity: usize,

    /// Render data delivered as soon as the guest is ready
    pub initial_render_data: Option<Value>,

    /// Answer guest messages carrying a `messageId` with `message-received`
    pub acknowledge_messages: bool,

    /// Accessible title for the rendering context
    pub title: Option<String>,
}

impl BridgeConfig {
    /// Create a configuration with defaults for everything but the target
    pub fn new(target: SurfaceTarget) -> Self {
        Self {
            target,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sandbox: SandboxPolicy::default(),
            max_buffered_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
            inbound_queue_capacity: DEFAULT_INBOUND_QUEUE_CAPACITY,
            initial_render_data: None,
            acknowledge_messages: true,
            title: None,
        }
    }

    /// Replace the rendered content
    pub fn with_target(mut self, target: SurfaceTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxPolicy) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_max_buffered_messages(mut self, max: usize) -> Self {
        self.max_buffered_messages = max;
        self
    }

    pub fn with_inbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.inbound_queue_capacity = capacity;
        self
    }

    pub fn with_initial_render_data(mut self, data: Value) -> Self {
        self.initial_render_data = Some(data);
        self
    }

    pub fn with_acknowledge_messages(mut self, acknowledge: bool) -> Self {
        self.acknowledge_messages = acknowledge;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(SurfaceTarget::RawHtml(String::new()))
    }
}

/// Options for [`BridgeHandle::send_to_guest`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Wait for a `guest-response` carrying the minted `requestId`
    pub expect_reply: bool,
    /// Override the session's default request timeout
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn expect_reply() -> Self {
        Self {
            expect_reply: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Factory for bridge sessions
#[derive(Clone)]
pub struct Bridge {
    runtime: Arc<dyn SurfaceRuntime>,
    handlers: Arc<dyn CapabilityHandlers>,
    diagnostics: Option<DiagnosticSink>,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn SurfaceRuntime>, handlers: Arc<dyn CapabilityHandlers>) -> Self {
        Self {
            runtime,
            handlers,
            diagnostics: None,
        }
    }

    /// Receive host-visible diagnostics for every session mounted by this bridge
    pub fn with_diagnostics<F>(mut self, sink: F) -> Self
    where
        F: Fn(Diagnostic) + Send + Sync + 'static,
    {
        self.diagnostics = Some(Arc::new(sink));
        self
    }

    /// Create the surface and start processing guest messages.
    ///
    /// Fails with [`Error::NoRuntime`] outside a tokio runtime, and when the
    /// target cannot be rendered or the runtime cannot create the surface.
    pub fn mount(&self, config: BridgeConfig) -> Result<BridgeHandle> {
        let tasks = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::NoRuntime(e.to_string()))?;
        let content = config.target.into_content()?;
        let spec = FrameSpec {
            content,
            sandbox: config.sandbox,
            title: config.title,
        };

        let session_id = Uuid::new_v4().simple().to_string();
        let registry = CorrelationRegistry::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));

        let surface = SurfaceController::mount(
            self.runtime.clone(),
            &spec,
            registry.clone(),
            inbound_tx,
            self.diagnostics.clone(),
        )
        .inspect_err(|e| {
            tracing::warn!(session = %session_id, error = %e, "surface creation failed");
            emit(&self.diagnostics, || Diagnostic::LoadFailed {
                reason: e.to_string(),
            });
        })?;

        let mut lifecycle = Lifecycle::new(config.max_buffered_messages);
        lifecycle.mount()?;
        if let Some(data) = config.initial_render_data {
            lifecycle.gate(Envelope::new(Message::RenderData(data)))?;
        }
        let (phase_tx, _) = watch::channel(lifecycle.phase());

        let session = Arc::new(Session {
            ids: RequestIdSequence::new(format!("host-{}", &session_id[..8])),
            id: session_id,
            request_timeout: config.request_timeout,
            acknowledge_messages: config.acknowledge_messages,
            lifecycle: Mutex::new(lifecycle),
            phase_tx,
            registry,
            surface,
            dispatcher: Dispatcher::new(self.handlers.clone()),
            diagnostics: self.diagnostics.clone(),
            guest_in_flight: Mutex::new(HashSet::new()),
            failure: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tasks: tasks.clone(),
        });

        let span = tracing::debug_span!("ui_bridge", session = %session.id);
        tasks.spawn(run_inbound(session.clone(), inbound_rx).instrument(span));
        tracing::debug!(session = %session.id, source = %session.surface.source(), "bridge mounted");

        Ok(BridgeHandle { session })
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("diagnostics", &self.diagnostics.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to one mounted surface session.
///
/// Dropping the handle disposes the session.
#[derive(Debug)]
pub struct BridgeHandle {
    session: Arc<Session>,
}

impl BridgeHandle {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn phase(&self) -> Phase {
        self.session.lifecycle().phase()
    }

    /// Host -> guest requests still awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.session.registry.len()
    }

    /// Messages held until the guest is ready
    pub fn buffered_messages(&self) -> usize {
        self.session.lifecycle().buffered()
    }

    /// Wait until the guest signals ready.
    ///
    /// Fails if the session is disposed first, with the load error when the
    /// surface failed to load.
    pub async fn ready(&self) -> Result<()> {
        let mut phase_rx = self.session.phase_tx.subscribe();
        let phase = *phase_rx
            .wait_for(|phase| phase.is_ready() || *phase == Phase::Disposed)
            .await
            .map_err(|_| Error::Disposed)?;
        if phase == Phase::Disposed {
            return Err(self.session.disposed_error());
        }
        Ok(())
    }

    /// Send a message of `message_type` to the guest.
    ///
    /// With `expect_reply`, resolves with the guest's reply payload, or fails
    /// on timeout or disposal. Without it, resolves with `None` once the
    /// message is transmitted or buffered.
    pub async fn send_to_guest(
        &self,
        message_type: MessageType,
        payload: Value,
        options: SendOptions,
    ) -> Result<Option<Value>> {
        let message = Message::from_parts(message_type, Some(payload))?;
        if options.expect_reply {
            self.request_guest(message, options.timeout).await.map(Some)
        } else {
            self.notify_guest(message).map(|_| None)
        }
    }

    /// Fire-and-forget delivery to the guest
    pub fn notify_guest(&self, message: Message) -> Result<()> {
        check_direction(&message)?;
        self.session.deliver(Envelope::new(message))
    }

    /// Send a request to the guest and wait for its `guest-response`
    pub async fn request_guest(&self, message: Message, timeout: Option<Duration>) -> Result<Value> {
        check_direction(&message)?;
        let reply = self
            .session
            .deliver_request(message, timeout.unwrap_or(self.session.request_timeout))?;
        reply.wait().await
    }

    /// Deliver render data, buffered until the guest is ready
    pub fn send_render_data(&self, data: Value) -> Result<()> {
        self.notify_guest(Message::RenderData(data))
    }

    /// Report that the surface failed to load. Disposes the session.
    pub fn report_load_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(session = %self.session.id, reason = %reason, "surface failed to load");
        *lock(&self.session.failure) = Some(reason.clone());
        emit(&self.session.diagnostics, || Diagnostic::LoadFailed {
            reason: reason.clone(),
        });
        self.session.dispose(&format!("surface failed to load: {}", reason));
    }

    /// Tear the session down. Idempotent.
    pub fn dispose(&self) {
        self.session.dispose("session disposed");
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.session.dispose("bridge handle dropped");
    }
}

fn check_direction(message: &Message) -> Result<()> {
    let message_type = message.message_type();
    if message_type.host_may_send() {
        Ok(())
    } else {
        Err(Error::InvalidDirection(message_type))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn emit(sink: &Option<DiagnosticSink>, diagnostic: impl FnOnce() -> Diagnostic) {
    if let Some(sink) = sink {
        sink(diagnostic());
    }
}

struct Session {
    id: String,
    ids: RequestIdSequence,
    request_timeout: Duration,
    acknowledge_messages: bool,
    lifecycle: Mutex<Lifecycle>,
    phase_tx: watch::Sender<Phase>,
    registry: CorrelationRegistry,
    surface: SurfaceController,
    dispatcher: Dispatcher,
    diagnostics: Option<DiagnosticSink>,
    guest_in_flight: Mutex<HashSet<String>>,
    failure: Mutex<Option<String>>,
    shutdown: CancellationToken,
    tasks: tokio::runtime::Handle,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("surface", &self.surface)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        lock(&self.lifecycle)
    }

    fn publish(&self, phase: Phase) {
        self.phase_tx.send_replace(phase);
    }

    fn disposed_error(&self) -> Error {
        match lock(&self.failure).clone() {
            Some(reason) => Error::SurfaceLoad(reason),
            None => Error::Disposed,
        }
    }

    /// Gate and transmit a host message. The lifecycle lock is held across
    /// the send so buffered messages can never be overtaken.
    fn deliver(&self, envelope: Envelope) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        self.deliver_locked(&mut lifecycle, envelope)?;
        let phase = lifecycle.phase();
        drop(lifecycle);
        self.publish(phase);
        Ok(())
    }

    fn deliver_locked(&self, lifecycle: &mut Lifecycle, envelope: Envelope) -> Result<()> {
        match lifecycle.gate(envelope)? {
            Outbound::Deliver(envelope) => self.surface.send(&envelope),
            Outbound::Buffered => {
                tracing::debug!(buffered = lifecycle.buffered(), "guest not ready, message buffered");
                Ok(())
            }
        }
    }

    fn deliver_request(&self, message: Message, timeout: Duration) -> Result<PendingReply> {
        let mut lifecycle = self.lifecycle();
        lifecycle.ensure_live()?;

        let request_id = self.ids.next_id();
        let reply = self.registry.register(request_id.clone(), timeout)?;
        let envelope = Envelope::new(message).with_request_id(request_id.clone());
        if let Err(e) = self.deliver_locked(&mut lifecycle, envelope) {
            self.registry.reject(&request_id, e.clone());
            return Err(e);
        }
        let phase = lifecycle.phase();
        drop(lifecycle);
        self.publish(phase);
        Ok(reply)
    }

    /// Send an answer to the guest, bypassing the readiness buffer
    fn reply(&self, envelope: Envelope) {
        if !self.lifecycle().accepts_inbound() {
            return;
        }
        if let Err(e) = self.surface.send(&envelope) {
            tracing::warn!(error = %e, message_type = %envelope.message_type(), "failed to reply to guest");
            emit(&self.diagnostics, || Diagnostic::SendFailed {
                error: e.to_string(),
            });
        }
    }

    fn dispose(&self, reason: &str) {
        let first = self.lifecycle().dispose();
        if !first {
            return;
        }
        self.publish(Phase::Disposed);
        self.shutdown.cancel();
        self.surface.teardown(reason);
        lock(&self.guest_in_flight).clear();
        tracing::debug!(session = %self.id, reason, "bridge disposed");
    }

    fn handle_inbound(self: &Arc<Self>, raw: Value) {
        let envelope = match envelope::decode(&raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(error = %error, "dropping malformed guest message");
                if let Some(request_id) = envelope::request_id_hint(&raw) {
                    self.reply(Envelope::error(
                        Some(request_id),
                        codes::INVALID_REQUEST,
                        error.to_string(),
                    ));
                }
                emit(&self.diagnostics, || Diagnostic::Malformed { error });
                return;
            }
        };

        if !self.lifecycle().accepts_inbound() {
            tracing::debug!(message_type = %envelope.message_type(), "session not accepting messages, dropping");
            return;
        }

        let message_type = envelope.message_type();
        if message_type.direction() == Direction::HostToGuest {
            tracing::warn!(message_type = %message_type, "guest sent a host-only message type");
            if let Some(request_id) = envelope.request_id.clone() {
                self.reply(Envelope::error(
                    Some(request_id),
                    codes::INVALID_REQUEST,
                    format!("{} cannot be sent by the guest", message_type),
                ));
            }
            emit(&self.diagnostics, || Diagnostic::WrongDirection { message_type });
            return;
        }

        if self.acknowledge_messages && message_type != MessageType::MessageReceived {
            if let Some(message_id) = envelope.message_id.clone() {
                self.reply(Envelope::new(Message::MessageReceived).with_message_id(message_id));
            }
        }

        if message_type.is_request() || message_type == MessageType::SizeChange {
            self.spawn_dispatch(envelope);
            return;
        }

        let Envelope {
            message,
            request_id,
            ..
        } = envelope;
        match message {
            Message::ReadySignal => self.handle_ready(),
            Message::RenderDataRequest => self.resend_render_data(request_id),
            Message::GuestResponse(value) => {
                if let Some(request_id) = request_id {
                    if !self.registry.resolve(&request_id, value) {
                        emit(&self.diagnostics, || Diagnostic::UnmatchedReply { request_id });
                    }
                }
            }
            Message::Error(payload) => match request_id.or(payload.request_id) {
                Some(request_id) => {
                    let error = Error::Guest {
                        code: payload.code,
                        message: payload.message,
                    };
                    if !self.registry.reject(&request_id, error) {
                        emit(&self.diagnostics, || Diagnostic::UnmatchedReply { request_id });
                    }
                }
                None => {
                    tracing::warn!(code = payload.code, message = %payload.message, "guest reported an error");
                }
            },
            Message::MessageReceived => {
                tracing::trace!("guest acknowledged a message");
            }
            other => {
                tracing::debug!(message_type = %other.message_type(), "ignoring guest message");
            }
        }
    }

    fn handle_ready(&self) {
        let mut lifecycle = self.lifecycle();
        let flushed = match lifecycle.mark_ready() {
            Ok(Some(flushed)) => flushed,
            Ok(None) => {
                tracing::debug!("repeated ready signal ignored");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "ready signal in unexpected phase");
                return;
            }
        };

        tracing::debug!(flushed = flushed.len(), "guest ready, flushing buffered messages");
        let mut failures = Vec::new();
        for envelope in &flushed {
            if let Err(e) = self.surface.send(envelope) {
                tracing::warn!(error = %e, message_type = %envelope.message_type(), "failed to flush buffered message");
                failures.push((envelope.request_id.clone(), e));
            }
        }
        let phase = lifecycle.phase();
        drop(lifecycle);
        self.publish(phase);

        for (request_id, e) in failures {
            // Host requests that never left must not wait out their timeout
            if let Some(request_id) = request_id.filter(|id| self.registry.contains(id)) {
                self.registry.reject(&request_id, e.clone());
            }
            emit(&self.diagnostics, || Diagnostic::SendFailed {
                error: e.to_string(),
            });
        }
    }

    fn resend_render_data(&self, request_id: Option<String>) {
        let data = self.lifecycle().latest_render_data().cloned();
        match data {
            Some(data) => {
                let mut envelope = Envelope::new(Message::RenderData(data));
                envelope.request_id = request_id;
                if let Err(e) = self.deliver(envelope) {
                    tracing::warn!(error = %e, "failed to re-send render data");
                }
            }
            None => tracing::debug!("guest requested render data before any was provided"),
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, envelope: Envelope) {
        if let Some(request_id) = &envelope.request_id {
            if !lock(&self.guest_in_flight).insert(request_id.clone()) {
                tracing::warn!(request_id = %request_id, "duplicate guest request id in flight");
                self.reply(Envelope::error(
                    Some(request_id.clone()),
                    codes::INVALID_REQUEST,
                    format!("duplicate requestId {}", request_id),
                ));
                emit(&self.diagnostics, || Diagnostic::DuplicateRequest {
                    request_id: request_id.clone(),
                });
                return;
            }
        }

        let session = self.clone();
        self.tasks.spawn(
            async move {
                let message_type = envelope.message_type();
                let request_id = envelope.request_id.clone();
                let response = tokio::select! {
                    response = session.dispatcher.dispatch(envelope) => response,
                    _ = session.shutdown.cancelled() => {
                        tracing::debug!(message_type = %message_type, "session disposed, abandoning capability request");
                        return;
                    }
                };

                if let Some(request_id) = &request_id {
                    lock(&session.guest_in_flight).remove(request_id);
                }
                let Some(response) = response else {
                    return;
                };
                if let Message::Error(error) = &response.message {
                    emit(&session.diagnostics, || Diagnostic::HandlerFailed {
                        message_type,
                        request_id: request_id.clone(),
                        message: error.message.clone(),
                    });
                }
                session.reply(response);
            }
            .in_current_span(),
        );
    }
}

async fn run_inbound(session: Arc<Session>, mut inbound: mpsc::Receiver<Value>) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = session.shutdown.cancelled() => break,
            raw = inbound.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        session.handle_inbound(raw);
    }
    tracing::debug!("inbound loop stopped");
}

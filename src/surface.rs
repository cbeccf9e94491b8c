//! Sandboxed surface controller
//!
//! Owns one isolated rendering context for the lifetime of a session. The
//! host's native isolation primitive is reached through [`SurfaceRuntime`];
//! this module configures it, installs the single origin-scoped listener, and
//! is the only code that talks to the transport.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::bridge::{Diagnostic, DiagnosticSink};
use crate::correlation::CorrelationRegistry;
use crate::envelope::{self, Envelope};
use crate::error::{Error, Result};
use crate::resource::SurfaceContent;
use crate::transport::{Listener, ListenerId, SourceId, Transport, TransportEvent};

/// Sandbox tokens a policy may add on top of `allow-scripts`
const PERMITTED_TOKENS: &[&str] = &[
    "allow-downloads",
    "allow-forms",
    "allow-modals",
    "allow-orientation-lock",
    "allow-pointer-lock",
    "allow-popups",
    "allow-popups-to-escape-sandbox",
    "allow-presentation",
];

/// Permission/attribute set for the rendering context.
///
/// Scripts always run; same-origin access and top-level navigation are never
/// granted. Popups, forms and modals are explicit opt-ins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    tokens: BTreeSet<String>,
}

impl SandboxPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_popups(self, allow: bool) -> Self {
        self.toggle("allow-popups", allow)
    }

    pub fn with_forms(self, allow: bool) -> Self {
        self.toggle("allow-forms", allow)
    }

    pub fn with_modals(self, allow: bool) -> Self {
        self.toggle("allow-modals", allow)
    }

    /// Add a raw sandbox token. Tokens that would break isolation are refused.
    pub fn with_token(mut self, token: &str) -> Result<Self> {
        let token = token.trim().to_ascii_lowercase();
        if token == "allow-scripts" {
            return Ok(self);
        }
        if !PERMITTED_TOKENS.contains(&token.as_str()) {
            return Err(Error::SurfaceLoad(format!(
                "sandbox token `{}` is not permitted",
                token
            )));
        }
        self.tokens.insert(token);
        Ok(self)
    }

    pub fn allows(&self, token: &str) -> bool {
        token == "allow-scripts" || self.tokens.contains(token)
    }

    /// Value for the frame's `sandbox` attribute
    pub fn to_attribute(&self) -> String {
        std::iter::once("allow-scripts")
            .chain(self.tokens.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn toggle(mut self, token: &str, allow: bool) -> Self {
        if allow {
            self.tokens.insert(token.to_string());
        } else {
            self.tokens.remove(token);
        }
        self
    }
}

/// Everything the runtime needs to create a rendering context
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSpec {
    pub content: SurfaceContent,
    pub sandbox: SandboxPolicy,
    pub title: Option<String>,
}

/// A rendering context created by the runtime
pub struct MountedFrame {
    /// Reference inbound events must carry to be accepted
    pub source: SourceId,
    /// Origin inbound events must carry to be accepted
    pub origin: String,
    pub transport: Arc<dyn Transport>,
}

/// The host's native document-isolation primitive
pub trait SurfaceRuntime: Send + Sync {
    /// Create and start loading a rendering context
    fn create(&self, spec: &FrameSpec) -> Result<MountedFrame>;

    /// Release a rendering context. Must tolerate repeated calls.
    fn destroy(&self, source: &SourceId);
}

/// Owns one mounted frame and its transport listener
pub struct SurfaceController {
    runtime: Arc<dyn SurfaceRuntime>,
    source: SourceId,
    origin: String,
    transport: Arc<dyn Transport>,
    listener: Mutex<Option<ListenerId>>,
    registry: CorrelationRegistry,
    torn_down: AtomicBool,
}

impl SurfaceController {
    /// Create the frame and install the listener feeding `inbound`.
    ///
    /// Events whose source or origin differ from the frame's are dropped
    /// before they reach the queue.
    pub fn mount(
        runtime: Arc<dyn SurfaceRuntime>,
        spec: &FrameSpec,
        registry: CorrelationRegistry,
        inbound: mpsc::Sender<Value>,
        diagnostics: Option<DiagnosticSink>,
    ) -> Result<Self> {
        let frame = runtime.create(spec)?;
        tracing::debug!(
            source = %frame.source,
            origin = %frame.origin,
            sandbox = %spec.sandbox.to_attribute(),
            "surface created"
        );

        let listener = scoped_listener(
            frame.source.clone(),
            frame.origin.clone(),
            inbound,
            diagnostics,
        );
        let listener_id = frame.transport.on_message(listener);

        Ok(Self {
            runtime,
            source: frame.source,
            origin: frame.origin,
            transport: frame.transport,
            listener: Mutex::new(Some(listener_id)),
            registry,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Encode and post an envelope to the guest
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.is_torn_down() {
            return Err(Error::Disposed);
        }
        tracing::trace!(message_type = %envelope.message_type(), "sending to guest");
        self.transport.send(envelope::encode(envelope))
    }

    /// Remove the listener, release the frame, and cancel pending requests.
    ///
    /// Idempotent; only the first call has an effect.
    pub fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            self.transport.remove_listener(id);
        }
        self.runtime.destroy(&self.source);
        let cancelled = self.registry.cancel_all(reason);
        tracing::debug!(source = %self.source, cancelled, reason, "surface torn down");
    }
}

impl Drop for SurfaceController {
    fn drop(&mut self) {
        self.teardown("surface dropped");
    }
}

impl std::fmt::Debug for SurfaceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceController")
            .field("source", &self.source)
            .field("origin", &self.origin)
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}

fn scoped_listener(
    expected_source: SourceId,
    expected_origin: String,
    inbound: mpsc::Sender<Value>,
    diagnostics: Option<DiagnosticSink>,
) -> Listener {
    Arc::new(move |event: TransportEvent| {
        if event.source != expected_source || event.origin != expected_origin {
            // Never answered: the guest learns nothing about why it was dropped
            tracing::debug!(origin = %event.origin, source = %event.source, "dropping message from unexpected source");
            if let Some(sink) = &diagnostics {
                sink(Diagnostic::RejectedSource {
                    source: event.source,
                    origin: event.origin,
                });
            }
            return;
        }

        match inbound.try_send(event.data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(source = %expected_source, "inbound queue full, dropping guest message");
                if let Some(sink) = &diagnostics {
                    sink(Diagnostic::QueueOverflow);
                }
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(source = %expected_source, "inbound queue closed, dropping guest message");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryRuntime;
    use serde_json::json;
    use std::time::Duration;

    fn html_spec() -> FrameSpec {
        FrameSpec {
            content: SurfaceContent::Html("<p>hi</p>".to_string()),
            sandbox: SandboxPolicy::new(),
            title: None,
        }
    }

    #[test]
    fn test_sandbox_attribute() {
        assert_eq!(SandboxPolicy::new().to_attribute(), "allow-scripts");

        let policy = SandboxPolicy::new()
            .with_popups(true)
            .with_forms(true)
            .with_forms(false);
        assert_eq!(policy.to_attribute(), "allow-scripts allow-popups");
        assert!(policy.allows("allow-scripts"));
        assert!(!policy.allows("allow-same-origin"));
    }

    #[test]
    fn test_sandbox_refuses_isolation_breaking_tokens() {
        assert!(SandboxPolicy::new().with_token("allow-same-origin").is_err());
        assert!(SandboxPolicy::new().with_token("allow-top-navigation").is_err());
        let policy = SandboxPolicy::new().with_token("allow-downloads").unwrap();
        assert_eq!(policy.to_attribute(), "allow-scripts allow-downloads");
    }

    #[tokio::test]
    async fn test_only_expected_source_reaches_queue() {
        let runtime = MemoryRuntime::new();
        let (tx, mut rx) = mpsc::channel(8);
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let seen = rejected.clone();
        let sink: DiagnosticSink = Arc::new(move |d| seen.lock().unwrap().push(d));

        let controller = SurfaceController::mount(
            runtime.clone(),
            &html_spec(),
            CorrelationRegistry::new(),
            tx,
            Some(sink),
        )
        .unwrap();
        let guest = runtime.take_guest().unwrap();

        guest.post_as(SourceId::new("intruder"), "null", json!({"type": "ready-signal"}));
        guest.post_as(guest.source().clone(), "https://evil.example", json!({"type": "ready-signal"}));
        guest.post(json!({"type": "ready-signal"}));

        assert_eq!(rx.recv().await, Some(json!({"type": "ready-signal"})));
        assert!(rx.try_recv().is_err());
        assert_eq!(rejected.lock().unwrap().len(), 2);
        drop(controller);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_cancels() {
        let runtime = MemoryRuntime::new();
        let registry = CorrelationRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let controller =
            SurfaceController::mount(runtime.clone(), &html_spec(), registry.clone(), tx, None)
                .unwrap();
        let guest = runtime.take_guest().unwrap();
        let pending = registry.register("host-1", Duration::from_secs(30)).unwrap();

        controller.teardown("disposed");
        controller.teardown("disposed again");

        assert_eq!(guest.transport().listener_count(), 0);
        assert_eq!(runtime.destroyed(), vec![controller.source().clone()]);
        assert!(pending.wait().await.unwrap_err().is_cancelled());
        assert!(matches!(
            controller.send(&Envelope::new(crate::envelope::Message::ReadySignal)),
            Err(Error::Disposed)
        ));
    }

    #[test]
    fn test_creation_failure_propagates() {
        let runtime = MemoryRuntime::new();
        runtime.fail_next("404");
        let (tx, _rx) = mpsc::channel(8);
        let err = SurfaceController::mount(
            runtime.clone(),
            &html_spec(),
            CorrelationRegistry::new(),
            tx,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SurfaceLoad(reason) if reason == "404"));
        assert_eq!(runtime.live_frames(), 0);
    }
}

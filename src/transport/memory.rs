//! In-memory transport and surface runtime
//!
//! Lets a host (or a test) drive the bridge without a real isolation
//! primitive. Each created frame gets a [`MemoryTransport`] for the host side
//! and a [`GuestEndpoint`] that plays the guest: it posts messages into the
//! host's listeners and receives whatever the host sends.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

use super::{Listener, ListenerId, SourceId, Transport, TransportEvent};
use crate::envelope::{self, Envelope};
use crate::error::{Error, Result};
use crate::resource::SurfaceContent;
use crate::surface::{FrameSpec, MountedFrame, SurfaceRuntime};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host side of an in-memory channel
pub struct MemoryTransport {
    listeners: Mutex<HashMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
    outbox: mpsc::UnboundedSender<Value>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Create a transport and the guest endpoint attached to it
    pub fn pair(source: SourceId, origin: impl Into<String>) -> (Arc<Self>, GuestEndpoint) {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            outbox,
            closed: AtomicBool::new(false),
        });
        let guest = GuestEndpoint {
            transport: transport.clone(),
            source,
            origin: origin.into(),
            inbox,
        };
        (transport, guest)
    }

    /// Deliver an event to every installed listener
    pub fn emit(&self, event: TransportEvent) {
        // Snapshot so listeners can add/remove listeners re-entrantly
        let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener(event.clone());
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Stop accepting outbound messages
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: Value) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("transport closed".to_string()));
        }
        self.outbox
            .send(message)
            .map_err(|_| Error::Transport("guest endpoint dropped".to_string()))
    }

    fn on_message(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        lock(&self.listeners).remove(&id);
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Guest side of an in-memory channel
#[derive(Debug)]
pub struct GuestEndpoint {
    transport: Arc<MemoryTransport>,
    source: SourceId,
    origin: String,
    inbox: mpsc::UnboundedReceiver<Value>,
}

impl GuestEndpoint {
    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn transport(&self) -> &Arc<MemoryTransport> {
        &self.transport
    }

    /// Post a raw message as this guest
    pub fn post(&self, data: Value) {
        self.post_as(self.source.clone(), self.origin.clone(), data);
    }

    /// Post an envelope as this guest
    pub fn post_envelope(&self, envelope: &Envelope) {
        self.post(envelope::encode(envelope));
    }

    /// Post a message claiming an arbitrary source and origin
    pub fn post_as(&self, source: SourceId, origin: impl Into<String>, data: Value) {
        self.transport.emit(TransportEvent {
            source,
            origin: origin.into(),
            data,
        });
    }

    /// Next raw message sent by the host
    pub async fn recv(&mut self) -> Option<Value> {
        self.inbox.recv().await
    }

    /// Next message sent by the host, decoded
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        let raw = self.recv().await?;
        envelope::decode(&raw).ok()
    }

    /// Message already sent by the host, if any
    pub fn try_recv(&mut self) -> Option<Value> {
        self.inbox.try_recv().ok()
    }
}

#[derive(Default)]
struct RuntimeState {
    next_frame: u64,
    frames: HashMap<SourceId, Arc<MemoryTransport>>,
    guests: VecDeque<GuestEndpoint>,
    specs: Vec<FrameSpec>,
    destroyed: Vec<SourceId>,
    fail_next: Option<String>,
}

/// [`SurfaceRuntime`] that creates in-memory frames
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<RuntimeState>,
}

impl MemoryRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the guest endpoint of the oldest frame not yet claimed
    pub fn take_guest(&self) -> Option<GuestEndpoint> {
        lock(&self.state).guests.pop_front()
    }

    /// Make the next `create` call fail with a load error
    pub fn fail_next(&self, reason: impl Into<String>) {
        lock(&self.state).fail_next = Some(reason.into());
    }

    /// Specs of every frame created so far
    pub fn created(&self) -> Vec<FrameSpec> {
        lock(&self.state).specs.clone()
    }

    /// Sources of every frame destroyed so far
    pub fn destroyed(&self) -> Vec<SourceId> {
        lock(&self.state).destroyed.clone()
    }

    /// Number of frames currently alive
    pub fn live_frames(&self) -> usize {
        lock(&self.state).frames.len()
    }
}

impl SurfaceRuntime for MemoryRuntime {
    fn create(&self, spec: &FrameSpec) -> Result<MountedFrame> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.fail_next.take() {
            return Err(Error::SurfaceLoad(reason));
        }

        state.next_frame += 1;
        let source = SourceId::new(format!("frame-{}", state.next_frame));
        let origin = match &spec.content {
            SurfaceContent::Url(url) => url.origin().ascii_serialization(),
            // srcdoc frames without allow-same-origin get an opaque origin
            SurfaceContent::Html(_) | SurfaceContent::RemoteDom { .. } => "null".to_string(),
        };

        let (transport, guest) = MemoryTransport::pair(source.clone(), origin.clone());
        state.frames.insert(source.clone(), transport.clone());
        state.guests.push_back(guest);
        state.specs.push(spec.clone());

        Ok(MountedFrame {
            source,
            origin,
            transport,
        })
    }

    fn destroy(&self, source: &SourceId) {
        let mut state = lock(&self.state);
        if let Some(transport) = state.frames.remove(source) {
            transport.close();
            state.destroyed.push(source.clone());
        }
    }
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("live_frames", &self.live_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_host_send_reaches_guest() {
        let (transport, mut guest) = MemoryTransport::pair(SourceId::new("f1"), "null");
        transport.send(json!({"type": "render-data", "payload": 1})).unwrap();
        assert_eq!(
            guest.recv().await,
            Some(json!({"type": "render-data", "payload": 1}))
        );
        assert_eq!(guest.try_recv(), None);
    }

    #[test]
    fn test_guest_post_reaches_listeners() {
        let (transport, guest) = MemoryTransport::pair(SourceId::new("f1"), "null");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let id = transport.on_message(Arc::new(move |event| {
            assert_eq!(event.source, SourceId::new("f1"));
            assert_eq!(event.origin, "null");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        guest.post(json!({"type": "ready-signal"}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        transport.remove_listener(id);
        guest.post(json!({"type": "ready-signal"}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_transport_rejects_send() {
        let (transport, _guest) = MemoryTransport::pair(SourceId::new("f1"), "null");
        transport.close();
        assert!(matches!(
            transport.send(json!({})),
            Err(Error::Transport(_))
        ));
    }
}

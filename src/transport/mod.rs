//! Transport abstraction between the host and a guest surface
//!
//! The bridge only needs two things from the underlying cross-document
//! channel: post a raw message to the guest, and observe raw messages
//! arriving from anywhere along with their source reference and origin.
//! Real hosts adapt their webview/iframe messaging to [`Transport`];
//! [`memory`] provides an in-process implementation.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;

pub use memory::{GuestEndpoint, MemoryRuntime, MemoryTransport};

/// Opaque reference to the window/frame that posted a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw message observed on the transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub source: SourceId,
    /// Serialized origin of the sender (`"null"` for opaque origins)
    pub origin: String,
    pub data: Value,
}

/// Handle for removing an installed listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Callback invoked for every message the transport observes
pub type Listener = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Untyped, unreliable message channel to one guest surface
pub trait Transport: Send + Sync {
    /// Post a raw message to the guest
    fn send(&self, message: Value) -> Result<()>;

    /// Install a listener for inbound messages
    fn on_message(&self, listener: Listener) -> ListenerId;

    /// Remove a previously installed listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);
}

//! # reson-ui
//!
//! Host-side bridge for sandboxed interactive UI surfaces.
//!
//! A tool or server hands the host a UI resource; the host renders it in an
//! isolated context and talks to it only through structured messages. This
//! crate provides:
//! - **Envelope codec**: the closed message vocabulary and its validation
//! - **Correlation**: request/response matching with per-request timeouts
//! - **Lifecycle**: mount, ready and dispose gating with ordered buffering
//! - **Dispatch**: guest requests mapped onto host capabilities
//! - **Surface**: sandbox policy and source/origin-scoped listening
//! - **MCP**: capabilities forwarded to an MCP server (`mcp` feature)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reson_ui::bridge::{Bridge, BridgeConfig, SurfaceTarget};
//! use reson_ui::dispatch::HandlerSet;
//! use reson_ui::resource::ResourceDescriptor;
//! use reson_ui::transport::MemoryRuntime;
//!
//! # async fn example() -> reson_ui::Result<()> {
//! let handlers = HandlerSet::new()
//!     .on_prompt(|request| Box::pin(async move { Ok(serde_json::json!({"queued": request.prompt})) }));
//!
//! let bridge = Bridge::new(MemoryRuntime::new(), Arc::new(handlers));
//! let handle = bridge.mount(BridgeConfig::new(SurfaceTarget::Resource(
//!     ResourceDescriptor::text("ui://weather/card", "text/html;profile=mcp-app", "<div id=app></div>"),
//! )))?;
//!
//! handle.send_render_data(serde_json::json!({"city": "Oslo"}))?;
//! handle.ready().await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod correlation;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod resource;
pub mod surface;
pub mod transport;

#[cfg(feature = "mcp")]
pub mod mcp;

pub use bridge::{Bridge, BridgeConfig, BridgeHandle, Diagnostic, SendOptions, SurfaceTarget};
pub use dispatch::{CapabilityHandlers, HandlerSet};
pub use envelope::{Envelope, Message, MessageType};
pub use error::{Error, Result};
pub use lifecycle::Phase;

#[cfg(feature = "mcp")]
pub use mcp::McpCapabilities;

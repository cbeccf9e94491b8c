//! MCP-backed capabilities
//!
//! Forwards guest tool calls and resource reads to an MCP server through an
//! rmcp client peer. Everything else goes to an optional fallback handler set.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, ReadResourceRequestParams};
use rmcp::service::Peer;
use rmcp::RoleClient;
use serde::Serialize;
use serde_json::Value;

use crate::dispatch::{CapabilityHandlers, NoCapabilities};
use crate::envelope::{
    LinkOpenRequest, LinkOpenResult, PromptRequest, ResourceReadRequest, SizeChange,
    ToolCallRequest,
};
use crate::error::{Error, Result};
use crate::resource::ResourceDescriptor;

/// [`CapabilityHandlers`] backed by a connected MCP client
#[derive(Clone)]
pub struct McpCapabilities {
    peer: Peer<RoleClient>,
    fallback: Arc<dyn CapabilityHandlers>,
}

impl McpCapabilities {
    pub fn new(peer: Peer<RoleClient>) -> Self {
        Self {
            peer,
            fallback: Arc::new(NoCapabilities),
        }
    }

    /// Handle prompts, links, generic messages and size changes with `fallback`
    pub fn with_fallback(mut self, fallback: Arc<dyn CapabilityHandlers>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Read a `ui://` resource and return its first content as a descriptor
    pub async fn fetch_ui_resource(&self, uri: impl Into<String>) -> Result<ResourceDescriptor> {
        let uri = uri.into();
        let result = self
            .peer
            .read_resource(ReadResourceRequestParams {
                meta: None,
                uri: uri.clone(),
            })
            .await
            .map_err(|e| Error::Handler(format!("Failed to read resource '{}': {}", uri, e)))?;

        let contents = result
            .contents
            .first()
            .ok_or_else(|| Error::UnsupportedContent(format!("{} returned no contents", uri)))?;
        ResourceDescriptor::try_from(contents)
    }
}

impl std::fmt::Debug for McpCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpCapabilities").finish_non_exhaustive()
    }
}

#[async_trait]
impl CapabilityHandlers for McpCapabilities {
    async fn call_tool(&self, request: ToolCallRequest) -> Result<Value> {
        let ToolCallRequest { tool_name, params } = request;
        tracing::debug!(tool = %tool_name, "forwarding guest tool call");
        let result = self
            .peer
            .call_tool(CallToolRequestParams {
                meta: None,
                name: tool_name.clone().into(),
                arguments: Some(params),
                task: None,
            })
            .await
            .map_err(|e| Error::Handler(format!("Failed to call tool '{}': {}", tool_name, e)))?;
        to_payload(&result)
    }

    async fn read_resource(&self, request: ResourceReadRequest) -> Result<Value> {
        let uri = request.uri;
        let result = self
            .peer
            .read_resource(ReadResourceRequestParams {
                meta: None,
                uri: uri.clone(),
            })
            .await
            .map_err(|e| Error::Handler(format!("Failed to read resource '{}': {}", uri, e)))?;
        to_payload(&result)
    }

    async fn open_link(&self, request: LinkOpenRequest) -> Result<LinkOpenResult> {
        self.fallback.open_link(request).await
    }

    async fn send_prompt(&self, request: PromptRequest) -> Result<Value> {
        self.fallback.send_prompt(request).await
    }

    async fn on_message(&self, payload: Value) -> Result<Value> {
        self.fallback.on_message(payload).await
    }

    async fn on_size_change(&self, size: SizeChange) {
        self.fallback.on_size_change(size).await
    }
}

fn to_payload<T: Serialize>(result: &T) -> Result<Value> {
    serde_json::to_value(result).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::{CallToolResult, Content};
    use serde_json::json;

    #[test]
    fn test_tool_result_payload_shape() {
        let result = CallToolResult::success(vec![Content::text("42")]);
        let payload = to_payload(&result).unwrap();
        assert_eq!(payload["content"][0], json!({"type": "text", "text": "42"}));
    }
}

//! UI resource descriptors
//!
//! The bridge consumes resource descriptors produced elsewhere (an MCP
//! `resources/read` result, a tool result's embedded resource). Only the
//! declared MIME type and the body matter here; `ui://` URIs are opaque keys.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// The URI scheme for UI resources
pub const UI_SCHEME: &str = "ui";

/// MIME type for MCP App HTML resources
pub const MCP_APP_MIME_TYPE: &str = "text/html;profile=mcp-app";

/// MIME type for plain HTML resources
pub const HTML_MIME_TYPE: &str = "text/html";

/// MIME type for external URL resources
pub const URI_LIST_MIME_TYPE: &str = "text/uri-list";

/// MIME type for remote DOM scripts (`framework` parameter selects the renderer)
pub const REMOTE_DOM_MIME_TYPE: &str = "application/vnd.mcp-ui.remote-dom+javascript";

/// Body of a resource, either inline text or base64-encoded bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceBody {
    Text(String),
    Blob(String),
}

/// A serialized UI resource as produced by a resource factory or server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub body: ResourceBody,
}

impl ResourceDescriptor {
    pub fn text(uri: impl Into<String>, mime_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some(mime_type.into()),
            body: ResourceBody::Text(text.into()),
        }
    }

    pub fn blob(uri: impl Into<String>, mime_type: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mime_type: Some(mime_type.into()),
            body: ResourceBody::Blob(base64.into()),
        }
    }

    /// Whether the URI uses the `ui://` scheme
    pub fn is_ui_resource(&self) -> bool {
        self.uri
            .split_once("://")
            .is_some_and(|(scheme, _)| scheme == UI_SCHEME)
    }

    /// Body as UTF-8 text, decoding base64 blobs
    pub fn decoded_text(&self) -> Result<String> {
        match &self.body {
            ResourceBody::Text(text) => Ok(text.clone()),
            ResourceBody::Blob(data) => {
                let bytes = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
                String::from_utf8(bytes).map_err(|_| {
                    Error::UnsupportedContent(format!("blob for {} is not UTF-8", self.uri))
                })
            }
        }
    }
}

/// Renderer expected by a remote DOM script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteDomFramework {
    React,
    WebComponents,
}

/// What the surface renders
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceContent {
    /// Inline markup loaded via srcdoc
    Html(String),
    /// External page
    Url(Url),
    /// Script rendered by the host's remote DOM receiver
    RemoteDom {
        script: String,
        framework: RemoteDomFramework,
    },
}

impl SurfaceContent {
    /// Resolve a descriptor into renderable content by its MIME type
    pub fn from_descriptor(descriptor: &ResourceDescriptor) -> Result<Self> {
        let mime = descriptor.mime_type.as_deref().ok_or_else(|| {
            Error::UnsupportedContent(format!("{} has no MIME type", descriptor.uri))
        })?;
        let (essence, params) = split_mime(mime);

        match essence.as_str() {
            HTML_MIME_TYPE => Ok(SurfaceContent::Html(descriptor.decoded_text()?)),
            URI_LIST_MIME_TYPE => first_url(&descriptor.decoded_text()?)
                .map(SurfaceContent::Url)
                .ok_or_else(|| {
                    Error::UnsupportedContent(format!(
                        "{} contains no http(s) URL",
                        descriptor.uri
                    ))
                }),
            REMOTE_DOM_MIME_TYPE => {
                let framework = match param(&params, "framework").as_deref() {
                    None | Some("react") => RemoteDomFramework::React,
                    Some("webcomponents") => RemoteDomFramework::WebComponents,
                    Some(other) => {
                        return Err(Error::UnsupportedContent(format!(
                            "unknown remote DOM framework `{}`",
                            other
                        )))
                    }
                };
                Ok(SurfaceContent::RemoteDom {
                    script: descriptor.decoded_text()?,
                    framework,
                })
            }
            _ => Err(Error::UnsupportedContent(format!(
                "MIME type `{}` is not renderable",
                mime
            ))),
        }
    }
}

fn split_mime(mime: &str) -> (String, Vec<(String, String)>) {
    let mut parts = mime.split(';');
    let essence = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let params = parts
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_ascii_lowercase(),
                v.trim().trim_matches('"').to_ascii_lowercase(),
            )
        })
        .collect();
    (essence, params)
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// First http(s) URL in a `text/uri-list` body; `#` lines are comments
fn first_url(list: &str) -> Option<Url> {
    list.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| Url::parse(line).ok())
        .find(|url| matches!(url.scheme(), "http" | "https"))
}

#[cfg(feature = "mcp")]
impl TryFrom<&rmcp::model::ResourceContents> for ResourceDescriptor {
    type Error = Error;

    fn try_from(contents: &rmcp::model::ResourceContents) -> Result<Self> {
        use rmcp::model::ResourceContents;

        Ok(match contents {
            ResourceContents::TextResourceContents {
                uri,
                mime_type,
                text,
                ..
            } => Self {
                uri: uri.clone(),
                mime_type: mime_type.clone(),
                body: ResourceBody::Text(text.clone()),
            },
            ResourceContents::BlobResourceContents {
                uri,
                mime_type,
                blob,
                ..
            } => Self {
                uri: uri.clone(),
                mime_type: mime_type.clone(),
                body: ResourceBody::Blob(blob.clone()),
            },
        })
    }
}

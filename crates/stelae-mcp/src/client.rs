use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::jsonrpc::{JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse::first_json_message;
use crate::types::{
    InitializeParams, InitializeResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, McpClientInfo, McpServerInfo, Prompt, Resource,
    ResourceTemplate, Tool,
};
use crate::PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    StreamableHttp,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::StreamableHttp => "streamable-http",
            TransportKind::Sse => "sse",
        }
    }
}

/// Everything a downstream reported at handshake time.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub server_info: Option<McpServerInfo>,
    pub protocol_version: String,
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
}

/// A raw JSON-RPC reply relayed from a downstream.
#[derive(Debug, Clone)]
pub struct ForwardedRpc {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// A callable downstream tool server.
///
/// The facade treats transports as opaque: a downstream performs the MCP
/// handshake, exposes the four catalog listings, accepts raw JSON-RPC bodies
/// at one or more sub-paths of its mount, and answers them.
#[async_trait]
pub trait Downstream: Send + Sync {
    fn transport(&self) -> TransportKind;

    /// Sub-paths (relative to the per-server mount) at which this downstream
    /// accepts JSON-RPC POSTs. The facade's adaptive probe converges on one.
    fn mount_suffixes(&self) -> Vec<String>;

    /// Initialize and index the downstream: handshake plus all four listings.
    async fn connect(&self, client_info: &McpClientInfo) -> anyhow::Result<Handshake>;

    /// Relay a raw JSON-RPC body and return the downstream's reply.
    async fn forward(&self, body: &[u8]) -> anyhow::Result<ForwardedRpc>;
}

#[derive(Debug, Clone)]
pub struct HttpDownstreamOptions {
    pub endpoint: Url,
    pub transport: TransportKind,
    pub auth_token: Option<String>,
    pub timeout: Duration,
    /// Override the transport-derived mount sub-paths.
    pub mount_suffixes: Option<Vec<String>>,
}

impl HttpDownstreamOptions {
    pub fn new(endpoint: Url, transport: TransportKind) -> Self {
        Self {
            endpoint,
            transport,
            auth_token: None,
            timeout: Duration::from_secs(30),
            mount_suffixes: None,
        }
    }
}

/// MCP client over plain HTTP POST (streamable-HTTP style).
///
/// Tracks the `mcp-session-id` returned by `initialize` and replays it on
/// every subsequent request. Responses may arrive as `application/json` or as
/// a single-event `text/event-stream` body.
pub struct HttpDownstream {
    http: reqwest::Client,
    endpoint: Url,
    transport: TransportKind,
    auth_token: Option<String>,
    mount_suffixes: Option<Vec<String>>,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<String>,
}

impl HttpDownstream {
    pub fn new(opts: HttpDownstreamOptions) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build reqwest client")?;
        Ok(Self {
            http,
            endpoint: opts.endpoint,
            transport: opts.transport,
            auth_token: opts.auth_token,
            mount_suffixes: opts.mount_suffixes,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(PROTOCOL_VERSION.to_string()),
        })
    }

    fn session_header(&self) -> Option<String> {
        self.session_id.lock().expect("session lock").clone()
    }

    async fn post_raw(&self, body: Vec<u8>) -> anyhow::Result<reqwest::Response> {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
            .header(
                "mcp-protocol-version",
                self.protocol_version.lock().expect("version lock").clone(),
            )
            .body(body);
        if let Some(token) = &self.auth_token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        if let Some(sid) = self.session_header() {
            req = req.header("mcp-session-id", sid);
        }
        req.send().await.context("send downstream request")
    }

    async fn send_request(&self, req_msg: JsonRpcRequest) -> anyhow::Result<JsonRpcResponse> {
        let body = serde_json::to_vec(&req_msg)?;
        let resp = self.post_raw(body).await?;

        let status = resp.status();
        if let Some(sid) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.lock().expect("session lock") = Some(sid.to_string());
        }

        if status == StatusCode::ACCEPTED {
            anyhow::bail!("downstream returned 202 accepted for a request");
        }
        if !status.is_success() {
            anyhow::bail!("downstream http status {status}");
        }

        let ct = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = resp.text().await.context("read downstream body")?;
        debug!(content_type = %ct, "downstream rpc response");

        let json: Value = if ct.starts_with("text/event-stream") {
            first_json_message(&text)?
        } else {
            serde_json::from_str(&text).context("parse downstream json")?
        };

        let msg: JsonRpcMessage = serde_json::from_value(json).context("parse json-rpc frame")?;
        let JsonRpcMessage::Response(r) = msg else {
            anyhow::bail!("expected a json-rpc response frame");
        };
        Ok(r)
    }

    async fn send_notification(&self, msg: &JsonRpcNotification) -> anyhow::Result<()> {
        let body = serde_json::to_vec(msg)?;
        let resp = self.post_raw(body).await?;
        if resp.status() == StatusCode::ACCEPTED || resp.status().is_success() {
            return Ok(());
        }
        anyhow::bail!("notification failed: {}", resp.status())
    }

    /// Issue a catalog listing, decoding `-32601` as "not supported, empty".
    async fn list<T: serde::de::DeserializeOwned + Default>(
        &self,
        method: &str,
    ) -> anyhow::Result<T> {
        let id = JsonRpcId::String(Uuid::new_v4().to_string());
        let resp = self
            .send_request(JsonRpcRequest::new(id, method, Some(serde_json::json!({}))))
            .await?;
        if let Some(err) = resp.error {
            if err.code == -32601 {
                return Ok(T::default());
            }
            anyhow::bail!("downstream rpc error {}: {}", err.code, err.message);
        }
        let Some(result) = resp.result else {
            anyhow::bail!("missing result for {method}");
        };
        serde_json::from_value(result).with_context(|| format!("decode {method} result"))
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn mount_suffixes(&self) -> Vec<String> {
        if let Some(custom) = &self.mount_suffixes {
            return custom.clone();
        }
        match self.transport {
            TransportKind::StreamableHttp => vec!["mcp".to_string()],
            TransportKind::Sse => vec!["message".to_string(), "messages".to_string()],
        }
    }

    async fn connect(&self, client_info: &McpClientInfo) -> anyhow::Result<Handshake> {
        let params = InitializeParams::new_default(&client_info.name, &client_info.version);
        let id = JsonRpcId::String(Uuid::new_v4().to_string());
        let resp = self
            .send_request(JsonRpcRequest::new(
                id,
                "initialize",
                Some(serde_json::to_value(params)?),
            ))
            .await?;
        if let Some(err) = resp.error {
            anyhow::bail!("initialize failed ({}): {}", err.code, err.message);
        }
        let init: InitializeResult =
            serde_json::from_value(resp.result.context("initialize result missing")?)
                .context("decode initialize result")?;
        *self.protocol_version.lock().expect("version lock") = init.protocol_version.clone();

        self.send_notification(&JsonRpcNotification::new("notifications/initialized", None))
            .await?;

        let tools: ListToolsResult = self.list("tools/list").await?;
        let prompts: ListPromptsResult = self.list("prompts/list").await?;
        let resources: ListResourcesResult = self.list("resources/list").await?;
        let templates: ListResourceTemplatesResult = self.list("resources/templates/list").await?;

        Ok(Handshake {
            server_info: Some(init.server_info),
            protocol_version: init.protocol_version,
            tools: tools.tools,
            prompts: prompts.prompts,
            resources: resources.resources,
            resource_templates: templates.resource_templates,
        })
    }

    async fn forward(&self, body: &[u8]) -> anyhow::Result<ForwardedRpc> {
        let resp = self.post_raw(body.to_vec()).await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let body = resp.bytes().await.context("read forwarded body")?.to_vec();
        Ok(ForwardedRpc {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_mount_suffix_defaults() {
        let opts = HttpDownstreamOptions::new(
            Url::parse("http://127.0.0.1:9/mcp").expect("url"),
            TransportKind::StreamableHttp,
        );
        let client = HttpDownstream::new(opts).expect("client");
        assert_eq!(client.mount_suffixes(), vec!["mcp".to_string()]);

        let mut opts = HttpDownstreamOptions::new(
            Url::parse("http://127.0.0.1:9/sse").expect("url"),
            TransportKind::Sse,
        );
        opts.mount_suffixes = Some(vec!["messages".to_string()]);
        let client = HttpDownstream::new(opts).expect("client");
        assert_eq!(client.mount_suffixes(), vec!["messages".to_string()]);
    }
}

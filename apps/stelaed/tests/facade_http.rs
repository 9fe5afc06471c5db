use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use stelae_core::adapter::load_status;
use stelae_core::config::{Config, ManifestConfig, McpProxyConfig, ServerConfig, ServerOptions};
use stelae_core::paths::Homes;
use stelae_mcp::{
    Downstream, ForwardedRpc, Handshake, McpClientInfo, Tool, TransportKind,
};

use stelaed::app::{self, AppState};

/// Downstream double: fixed catalog, configurable mount sub-paths, canned
/// `tools/call` replies, optional slow handshake.
struct MockDownstream {
    tools: Vec<Tool>,
    suffixes: Vec<String>,
    reply_result: Value,
    connect_delay: Duration,
}

impl MockDownstream {
    fn new(tools: Vec<Tool>, reply_result: Value) -> Self {
        Self {
            tools,
            suffixes: vec!["mcp".to_string()],
            reply_result,
            connect_delay: Duration::ZERO,
        }
    }

    fn with_suffixes(mut self, suffixes: &[&str]) -> Self {
        self.suffixes = suffixes.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

#[async_trait]
impl Downstream for MockDownstream {
    fn transport(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn mount_suffixes(&self) -> Vec<String> {
        self.suffixes.clone()
    }

    async fn connect(&self, _client_info: &McpClientInfo) -> anyhow::Result<Handshake> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        Ok(Handshake {
            tools: self.tools.clone(),
            ..Handshake::default()
        })
    }

    async fn forward(&self, body: &[u8]) -> anyhow::Result<ForwardedRpc> {
        let incoming: Value = serde_json::from_slice(body).context("mock parse body")?;
        let reply = json!({
            "jsonrpc": "2.0",
            "id": incoming.get("id").cloned().unwrap_or(Value::Null),
            "result": self.reply_result.clone(),
        });
        Ok(ForwardedRpc {
            status: 200,
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(&reply).context("mock encode reply")?,
        })
    }
}

fn simple_tool(name: &str) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: Some(json!({ "type": "object" })),
        output_schema: None,
        annotations: None,
    }
}

struct Facade {
    base: String,
    state: AppState,
    _dir: TempDir,
    _server: tokio::task::JoinHandle<()>,
}

impl Facade {
    fn status_path(&self) -> std::path::PathBuf {
        self.state
            .homes
            .state
            .join("status.json")
    }

    fn overrides_path(&self) -> std::path::PathBuf {
        self.state.homes.state.join("overrides.json")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Assemble the real router over mock downstreams on an ephemeral port.
/// `wait_connect` controls whether startup blocks on readiness or leaves the
/// connect tasks racing the first request (warm-up scenarios).
async fn start_facade(
    base_path: &str,
    downstreams: Vec<(String, ServerOptions, Arc<dyn Downstream>)>,
    overrides_file: Option<Value>,
    wait_connect: bool,
) -> anyhow::Result<Facade> {
    let dir = tempfile::tempdir().context("tempdir")?;
    let homes = Homes::new(dir.path().join("config"), dir.path().join("state"));
    std::fs::create_dir_all(&homes.state).context("mk state home")?;

    let overrides_path = homes.state.join("overrides.json");
    if let Some(overrides) = overrides_file {
        std::fs::write(&overrides_path, serde_json::to_vec_pretty(&overrides)?)
            .context("write overrides fixture")?;
    }

    let mut servers = BTreeMap::new();
    for (name, options, _) in &downstreams {
        servers.insert(
            name.clone(),
            ServerConfig {
                transport: TransportKind::StreamableHttp,
                url: "http://127.0.0.1:1/mcp".to_string(),
                options: options.clone(),
            },
        );
    }

    let config = Config {
        mcp_proxy: McpProxyConfig {
            addr: "127.0.0.1:0".to_string(),
            base_url: format!("http://127.0.0.1:9090{base_path}"),
            name: "stelae".to_string(),
            version: "0.4.0".to_string(),
        },
        mcp_servers: servers,
        manifest: Some(ManifestConfig {
            name: "stelae".to_string(),
            version: "0.4.0".to_string(),
            description: "aggregating gateway".to_string(),
            tool_overrides_path: Some(overrides_path.to_string_lossy().to_string()),
            tool_schema_status_path: Some(
                homes.state.join("status.json").to_string_lossy().to_string(),
            ),
            ..Default::default()
        }),
    };

    let state = app::new_state(config, homes)?;
    if wait_connect {
        app::connect_all(state.clone(), downstreams).await;
    } else {
        tokio::spawn(app::connect_all(state.clone(), downstreams));
    }

    let router = app::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind")?;
    let addr = listener.local_addr().context("local addr")?;
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok(Facade {
        base: format!("http://{addr}"),
        state,
        _dir: dir,
        _server: server,
    })
}

async fn rpc_call(facade: &Facade, mcp_path: &str, payload: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(facade.url(mcp_path))
        .header("content-type", "application/json")
        .body(payload.to_string())
        .send()
        .await
        .expect("facade request")
}

fn tools_call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": { "name": name, "arguments": arguments }
    })
}

#[tokio::test]
async fn pass_through_call_keeps_structured_content() {
    let downstream = MockDownstream::new(
        vec![simple_tool("echo")],
        json!({
            "content": [ { "type": "text", "text": "" } ],
            "structuredContent": { "ok": true }
        }),
    );
    let facade = start_facade(
        "",
        vec![("srv".to_string(), ServerOptions::default(), Arc::new(downstream))],
        None,
        true,
    )
    .await
    .expect("facade");

    let resp = rpc_call(&facade, "/mcp", tools_call(1, "echo", json!({}))).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("x-proxy-dispatched-server")
            .and_then(|v| v.to_str().ok()),
        Some("srv")
    );
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["result"]["structuredContent"], json!({ "ok": true }));

    let status = load_status(&facade.status_path());
    let entry = &status["srv"]["echo"];
    assert_eq!(entry.last_adapter, "pass_through");
    assert_eq!(entry.consecutive_generic_count, 0);
}

#[tokio::test]
async fn declared_single_string_wraps_downstream_text() {
    let downstream = MockDownstream::new(
        vec![simple_tool("tool")],
        json!({ "content": [ { "type": "text", "text": "hello world" } ] }),
    );
    let overrides = json!({
        "schemaVersion": 2,
        "servers": {
            "srv": {
                "tools": {
                    "tool": {
                        "outputSchema": {
                            "type": "object",
                            "properties": { "result": { "type": "string" } },
                            "required": ["result"]
                        }
                    }
                }
            }
        }
    });
    let facade = start_facade(
        "",
        vec![("srv".to_string(), ServerOptions::default(), Arc::new(downstream))],
        Some(overrides),
        true,
    )
    .await
    .expect("facade");

    let resp = rpc_call(&facade, "/mcp", tools_call(2, "tool", json!({}))).await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(
        body["result"]["structuredContent"],
        json!({ "result": "hello world" })
    );

    let status = load_status(&facade.status_path());
    assert_eq!(status["srv"]["tool"].last_adapter, "declared");
    assert_eq!(status["srv"]["tool"].consecutive_generic_count, 0);
}

#[tokio::test]
async fn generic_adaptation_learns_schema_across_calls() {
    let downstream = MockDownstream::new(
        vec![simple_tool("plain")],
        json!({ "content": [ { "type": "text", "text": "text only" } ] }),
    );
    let facade = start_facade(
        "",
        vec![("srv".to_string(), ServerOptions::default(), Arc::new(downstream))],
        None,
        true,
    )
    .await
    .expect("facade");

    let resp = rpc_call(&facade, "/mcp", tools_call(3, "plain", json!({}))).await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(
        body["result"]["structuredContent"],
        json!({ "result": "text only" })
    );

    let status = load_status(&facade.status_path());
    assert_eq!(status["srv"]["plain"].last_adapter, "generic");
    assert_eq!(status["srv"]["plain"].consecutive_generic_count, 1);

    let raw = std::fs::read(facade.overrides_path()).expect("overrides written");
    let file: Value = serde_json::from_slice(&raw).expect("overrides json");
    assert!(file["schemaVersion"].as_u64().unwrap_or(0) >= 2);
    assert_eq!(
        file["servers"]["srv"]["tools"]["plain"]["outputSchema"]["required"],
        json!(["result"])
    );

    rpc_call(&facade, "/mcp", tools_call(4, "plain", json!({}))).await;
    let status = load_status(&facade.status_path());
    assert_eq!(status["srv"]["plain"].consecutive_generic_count, 2);
}

#[tokio::test]
async fn initialize_during_warmup_waits_and_lists_facade_tools() {
    let downstream = MockDownstream::new(vec![simple_tool("echo")], json!({}))
        .with_connect_delay(Duration::from_millis(500));
    let facade = start_facade(
        "",
        vec![("srv".to_string(), ServerOptions::default(), Arc::new(downstream))],
        None,
        false,
    )
    .await
    .expect("facade");

    let resp = rpc_call(
        &facade,
        "/mcp",
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
    )
    .await;
    assert_eq!(
        resp.headers()
            .get("x-proxy-waited-for-init")
            .and_then(|v| v.to_str().ok()),
        Some("true")
    );

    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(body["result"]["serverInfo"]["name"], "stelae");
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"search"), "tools: {names:?}");
    assert!(names.contains(&"fetch"), "tools: {names:?}");
    assert!(names.contains(&"echo"), "tools: {names:?}");
}

#[tokio::test]
async fn unknown_tool_yields_method_not_found() {
    let facade = start_facade(
        "",
        vec![(
            "srv".to_string(),
            ServerOptions::default(),
            Arc::new(MockDownstream::new(vec![simple_tool("echo")], json!({}))),
        )],
        None,
        true,
    )
    .await
    .expect("facade");

    let resp = rpc_call(&facade, "/mcp", tools_call(5, "does_not_exist", json!({}))).await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["code"], -32601);
    let message = body["error"]["message"].as_str().expect("message");
    assert!(
        message.contains("Unknown tool: does_not_exist"),
        "message: {message}"
    );
}

#[tokio::test]
async fn adaptive_dispatch_converges_on_messages_mount() {
    let downstream = MockDownstream::new(
        vec![simple_tool("summarize")],
        json!({ "content": [ { "type": "text", "text": "done" } ] }),
    )
    .with_suffixes(&["messages"]);
    let facade = start_facade(
        "/base",
        vec![("srv".to_string(), ServerOptions::default(), Arc::new(downstream))],
        None,
        true,
    )
    .await
    .expect("facade");

    let resp = rpc_call(&facade, "/base/mcp", tools_call(6, "summarize", json!({}))).await;
    assert_eq!(
        resp.headers()
            .get("x-proxy-internal-path")
            .and_then(|v| v.to_str().ok()),
        Some("/base/srv/messages")
    );
    assert_eq!(
        resp.headers()
            .get("x-proxy-internal-status")
            .and_then(|v| v.to_str().ok()),
        Some("OK")
    );
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(
        body["result"]["structuredContent"],
        json!({ "result": "done" })
    );
}

#[tokio::test]
async fn dispatch_exhaustion_maps_to_transport_error() {
    let downstream = MockDownstream::new(vec![simple_tool("echo")], json!({}))
        .with_suffixes(&["nowhere"]);
    let facade = start_facade(
        "",
        vec![("srv".to_string(), ServerOptions::default(), Arc::new(downstream))],
        None,
        true,
    )
    .await
    .expect("facade");

    let resp = rpc_call(&facade, "/mcp", tools_call(7, "echo", json!({}))).await;
    assert_eq!(
        resp.headers()
            .get("x-proxy-internal-path")
            .and_then(|v| v.to_str().ok()),
        Some("/srv/jsonrpc"),
        "last probed candidate is surfaced"
    );
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["code"], -32004);
}

#[tokio::test]
async fn facade_search_and_fetch_are_served_statically() {
    let facade = start_facade("", vec![], None, true).await.expect("facade");

    let resp = rpc_call(
        &facade,
        "/mcp",
        tools_call(8, "search", json!({ "query": "compliance" })),
    )
    .await;
    let body: Value = resp.json().await.expect("json body");
    let results = body["result"]["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    let first_id = results[0]["id"].as_str().expect("id").to_string();

    let resp = rpc_call(
        &facade,
        "/mcp",
        tools_call(9, "fetch", json!({ "id": first_id })),
    )
    .await;
    let body: Value = resp.json().await.expect("json body");
    assert!(body["result"]["title"].as_str().is_some());

    let resp = rpc_call(
        &facade,
        "/mcp",
        tools_call(10, "fetch", json!({ "id": "repo:missing.md" })),
    )
    .await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["code"], -32005);

    let resp = rpc_call(&facade, "/mcp", tools_call(11, "fetch", json!({}))).await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn notifications_batches_and_unknown_methods() {
    let facade = start_facade("", vec![], None, true).await.expect("facade");

    // notification: no id -> 204 without a body
    let resp = rpc_call(
        &facade,
        "/mcp",
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
    )
    .await;
    assert_eq!(resp.status(), 204);

    // batch: declined per element
    let resp = reqwest::Client::new()
        .post(facade.url("/mcp"))
        .header("content-type", "application/json")
        .body(
            json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "id": 2, "method": "tools/list" }
            ])
            .to_string(),
        )
        .send()
        .await
        .expect("batch request");
    let body: Value = resp.json().await.expect("json body");
    let entries = body.as_array().expect("array");
    assert_eq!(entries.len(), 2);
    for entry in entries {
        assert_eq!(entry["error"]["code"], -32601);
    }

    // unknown method
    let resp = rpc_call(
        &facade,
        "/mcp",
        json!({ "jsonrpc": "2.0", "id": 3, "method": "wat/huh" }),
    )
    .await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["error"]["message"], "Method not found");

    // ping
    let resp = rpc_call(
        &facade,
        "/mcp",
        json!({ "jsonrpc": "2.0", "id": 4, "method": "ping" }),
    )
    .await;
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["result"], json!({}));

    // invalid json -> 400
    let resp = reqwest::Client::new()
        .post(facade.url("/mcp"))
        .body("{ not json")
        .send()
        .await
        .expect("bad request");
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn head_returns_sse_headers_and_session() {
    let facade = start_facade("", vec![], None, true).await.expect("facade");

    let resp = reqwest::Client::new()
        .head(facade.url("/mcp"))
        .send()
        .await
        .expect("head");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        resp.headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("no-store")
    );
    let session = resp
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .expect("session id");
    assert!(!session.is_empty());
}

#[tokio::test]
async fn sse_stream_emits_endpoint_then_ready() {
    let facade = start_facade("", vec![], None, true).await.expect("facade");

    let mut resp = reqwest::Client::new()
        .get(facade.url("/mcp"))
        .send()
        .await
        .expect("sse get");
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("x-accel-buffering")
            .and_then(|v| v.to_str().ok()),
        Some("no")
    );

    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !collected.contains("event: ready") {
        let chunk = tokio::time::timeout_at(deadline, resp.chunk())
            .await
            .expect("sse frames before deadline")
            .expect("chunk read");
        let Some(chunk) = chunk else { break };
        collected.push_str(&String::from_utf8_lossy(&chunk));
    }

    assert!(collected.starts_with(':'), "comment tick first: {collected:?}");
    assert!(collected.contains("event: endpoint"), "{collected:?}");
    assert!(collected.contains("session_id="), "{collected:?}");
    let ready_data = collected
        .split("event: ready")
        .nth(1)
        .and_then(|rest| rest.split("data: ").nth(1))
        .and_then(|rest| rest.lines().next())
        .expect("ready data line");
    let ready: Value = serde_json::from_str(ready_data).expect("ready payload");
    assert_eq!(ready["state"], "ready");
    assert_eq!(ready["serverCount"], 0);
    assert!(ready["readyAt"].as_str().is_some());
}

#[tokio::test]
async fn manifest_document_uses_request_host() {
    let facade = start_facade(
        "",
        vec![(
            "srv".to_string(),
            ServerOptions::default(),
            Arc::new(MockDownstream::new(vec![simple_tool("echo")], json!({}))),
        )],
        None,
        true,
    )
    .await
    .expect("facade");

    let resp = reqwest::Client::new()
        .get(facade.url("/.well-known/mcp/manifest.json"))
        .send()
        .await
        .expect("manifest");
    let doc: Value = resp.json().await.expect("manifest json");

    assert_eq!(doc["name"], "stelae");
    assert_eq!(doc["endpoint"], "/mcp");
    let endpoint_url = doc["endpointURL"].as_str().expect("endpointURL");
    let host = facade.base.trim_start_matches("http://");
    assert_eq!(endpoint_url, format!("http://{host}/mcp"));

    let names: Vec<&str> = doc["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"search"));
    assert!(names.contains(&"fetch"));
    assert!(names.contains(&"echo"));

    assert_eq!(doc["servers"][0]["transport"], "streamable-http");
}

#[tokio::test]
async fn forged_internal_header_cannot_bypass_mount_auth() {
    let downstream = MockDownstream::new(
        vec![simple_tool("echo")],
        json!({ "content": [ { "type": "text", "text": "hi" } ] }),
    );
    let options = ServerOptions {
        auth_tokens: vec!["secret".to_string()],
        ..Default::default()
    };
    let facade = start_facade(
        "",
        vec![("srv".to_string(), options, Arc::new(downstream))],
        None,
        true,
    )
    .await
    .expect("facade");

    let body = tools_call(12, "echo", json!({})).to_string();
    let client = reqwest::Client::new();

    // forged internal header: rejected
    let resp = client
        .post(facade.url("/srv/mcp"))
        .header("x-proxy-internal", "1")
        .header("content-type", "application/json")
        .body(body.clone())
        .send()
        .await
        .expect("forged request");
    assert_eq!(resp.status(), 401);

    // proper bearer token: accepted
    let resp = client
        .post(facade.url("/srv/mcp"))
        .header("authorization", "Bearer secret")
        .header("content-type", "application/json")
        .body(body.clone())
        .send()
        .await
        .expect("bearer request");
    assert_eq!(resp.status(), 200);

    // no credentials: rejected
    let resp = client
        .post(facade.url("/srv/mcp"))
        .header("content-type", "application/json")
        .body(body.clone())
        .send()
        .await
        .expect("anonymous request");
    assert_eq!(resp.status(), 401);

    // the facade's own re-entry bypasses the mount auth
    let resp = rpc_call(&facade, "/mcp", tools_call(13, "echo", json!({}))).await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert!(body.get("error").is_none(), "facade call failed: {body}");
}

#[tokio::test]
async fn renamed_tool_routes_to_original_downstream_name() {
    let downstream = MockDownstream::new(
        vec![simple_tool("read_file")],
        json!({ "content": [ { "type": "text", "text": "contents" } ] }),
    );
    let overrides = json!({
        "schemaVersion": 2,
        "tools": { "read_file": { "name": "fs_read_file" } }
    });
    let facade = start_facade(
        "",
        vec![("fs".to_string(), ServerOptions::default(), Arc::new(downstream))],
        Some(overrides),
        true,
    )
    .await
    .expect("facade");

    // catalog lists the alias
    let resp = rpc_call(
        &facade,
        "/mcp",
        json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
    )
    .await;
    let body: Value = resp.json().await.expect("json body");
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .expect("tools")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"fs_read_file"), "tools: {names:?}");
    assert!(!names.contains(&"read_file"), "tools: {names:?}");

    // calling the alias reaches the downstream
    let resp = rpc_call(&facade, "/mcp", tools_call(2, "fs_read_file", json!({}))).await;
    assert_eq!(
        resp.headers()
            .get("x-proxy-dispatched-server")
            .and_then(|v| v.to_str().ok()),
        Some("fs")
    );
    let body: Value = resp.json().await.expect("json body");
    assert!(body.get("error").is_none(), "alias call failed: {body}");
}

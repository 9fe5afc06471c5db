use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use stelae_core::adapter::adapt_call_result;
use stelae_core::catalog::{
    build_initialize_result, collect_prompts, collect_resource_templates, collect_resources,
    collect_tools,
};
use stelae_core::facade::{
    build_facade_fetch_payload, build_facade_search_payload, FACADE_FETCH_TOOL, FACADE_SEARCH_TOOL,
};

use crate::app::AppState;
use crate::dispatch::try_dispatch;

pub const HDR_WAITED_FOR_INIT: &str = "x-proxy-waited-for-init";
pub const HDR_DISPATCHED_SERVER: &str = "x-proxy-dispatched-server";
pub const HDR_INTERNAL_PATH: &str = "x-proxy-internal-path";
pub const HDR_INTERNAL_STATUS: &str = "x-proxy-internal-status";
pub const HDR_REBUILT_INDEX: &str = "x-proxy-rebuilt-index";

/// Loosely-typed incoming frame: the id is echoed verbatim and params stay
/// raw until a branch needs them.
#[derive(Debug, Default, Deserialize)]
struct RpcFrame {
    #[serde(default)]
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

impl RpcFrame {
    fn id(&self) -> Value {
        self.id.clone().unwrap_or(Value::Null)
    }

    /// JSON-RPC notifications carry no id (an explicit `null` counts).
    fn is_notification(&self) -> bool {
        matches!(self.id, None | Some(Value::Null))
    }

    fn param_str(&self, key: &str) -> String {
        self.params
            .as_ref()
            .and_then(|p| p.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    fn argument_str(&self, key: &str) -> String {
        self.params
            .as_ref()
            .and_then(|p| p.get("arguments"))
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }
}

fn rpc_ok(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn rpc_err(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

struct ResponseHeaders(Vec<(&'static str, String)>);

impl ResponseHeaders {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn set(&mut self, name: &'static str, value: impl Into<String>) {
        self.0.push((name, value.into()));
    }

    fn apply(self, response: &mut Response) {
        for (name, value) in self.0 {
            if let Ok(v) = axum::http::HeaderValue::from_str(&value) {
                response.headers_mut().insert(name, v);
            }
        }
    }
}

fn json_response(payload: &Value, headers: ResponseHeaders) -> Response {
    let body = serde_json::to_vec(payload).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    headers.apply(&mut response);
    response
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "Bad Request").into_response()
}

/// JSON-RPC dispatch for `POST /<base>/mcp`.
pub async fn facade_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body = if body.is_empty() {
        Bytes::from_static(b"{}")
    } else {
        body
    };

    // Batches are declined per element rather than processed.
    if body.first() == Some(&b'[') {
        let Ok(batch) = serde_json::from_slice::<Vec<RpcFrame>>(&body) else {
            return bad_request();
        };
        let out: Vec<Value> = batch
            .into_iter()
            .map(|frame| rpc_err(frame.id(), -32601, "Batch not supported by facade"))
            .collect();
        return json_response(&Value::Array(out), ResponseHeaders::new());
    }

    let Ok(frame) = serde_json::from_slice::<RpcFrame>(&body) else {
        return bad_request();
    };

    if frame.is_notification() {
        debug!(method = %frame.method, "facade notification");
        return StatusCode::NO_CONTENT.into_response();
    }

    let mut extra = ResponseHeaders::new();

    match frame.method.as_str() {
        "initialize" => {
            if state.wait_for_ready().await {
                extra.set(HDR_WAITED_FOR_INIT, "true");
            }
            let servers = state.servers.read().await;
            let result = build_initialize_result(&state.proxy, &servers, state.overrides.as_ref());
            json_response(&rpc_ok(frame.id(), result), extra)
        }

        "tools/list" => {
            if state.wait_for_ready().await {
                extra.set(HDR_WAITED_FOR_INIT, "true");
            }
            let servers = state.servers.read().await;
            let tools: Vec<Value> = collect_tools(&servers, state.overrides.as_ref())
                .into_iter()
                .map(Value::Object)
                .collect();
            json_response(&rpc_ok(frame.id(), json!({ "tools": tools })), extra)
        }

        "prompts/list" => {
            if state.wait_for_ready().await {
                extra.set(HDR_WAITED_FOR_INIT, "true");
            }
            let servers = state.servers.read().await;
            let prompts = collect_prompts(&servers);
            json_response(&rpc_ok(frame.id(), json!({ "prompts": prompts })), extra)
        }

        "resources/list" => {
            if state.wait_for_ready().await {
                extra.set(HDR_WAITED_FOR_INIT, "true");
            }
            let servers = state.servers.read().await;
            let resources = collect_resources(&servers);
            json_response(&rpc_ok(frame.id(), json!({ "resources": resources })), extra)
        }

        "resources/templates/list" => {
            if state.wait_for_ready().await {
                extra.set(HDR_WAITED_FOR_INIT, "true");
            }
            let servers = state.servers.read().await;
            let templates = collect_resource_templates(&servers);
            json_response(
                &rpc_ok(frame.id(), json!({ "resourceTemplates": templates })),
                extra,
            )
        }

        "prompts/get" => {
            let name = frame.param_str("name");
            if name.is_empty() {
                return json_response(&rpc_err(frame.id(), -32602, "Missing prompt name"), extra);
            }
            let server = resolve_indexed(&state, IndexKind::Prompt, &name).await;
            let Some(server) = server else {
                return json_response(
                    &rpc_err(frame.id(), -32601, &format!("Unknown prompt: {name}")),
                    extra,
                );
            };
            dispatch_and_flush(&state, &server, &frame, &headers, &body, extra, None).await
        }

        "resources/read" => {
            let uri = frame.param_str("uri");
            if uri.is_empty() {
                return json_response(&rpc_err(frame.id(), -32602, "Missing resource uri"), extra);
            }
            let server = resolve_indexed(&state, IndexKind::Resource, &uri).await;
            let Some(server) = server else {
                return json_response(
                    &rpc_err(frame.id(), -32601, &format!("Unknown resource: {uri}")),
                    extra,
                );
            };
            dispatch_and_flush(&state, &server, &frame, &headers, &body, extra, None).await
        }

        "ping" => json_response(&rpc_ok(frame.id(), json!({})), extra),

        // A bare `search` method serves the same static hit set as the tool.
        FACADE_SEARCH_TOOL => {
            let query = frame.param_str("query");
            let payload = build_facade_search_payload(&query);
            let hits = payload["results"].as_array().map(Vec::len).unwrap_or(0);
            debug!(query = %query, hits, "facade search (static)");
            json_response(&rpc_ok(frame.id(), payload), extra)
        }

        "tools/call" => {
            let idx_empty = state.indexes.read().await.tools.is_empty();
            if idx_empty {
                state.rebuild_index().await;
                extra.set(HDR_REBUILT_INDEX, "true");
            }

            let name = frame.param_str("name");
            if name.is_empty() {
                return json_response(&rpc_err(frame.id(), -32602, "Missing tool name"), extra);
            }

            if name == FACADE_SEARCH_TOOL {
                let query = frame.argument_str("query");
                let payload = build_facade_search_payload(&query);
                return json_response(&rpc_ok(frame.id(), payload), extra);
            }
            if name == FACADE_FETCH_TOOL {
                let id = frame.argument_str("id");
                if id.is_empty() {
                    return json_response(&rpc_err(frame.id(), -32602, "Missing fetch id"), extra);
                }
                return match build_facade_fetch_payload(&id) {
                    Some(payload) => json_response(&rpc_ok(frame.id(), payload), extra),
                    None => json_response(&rpc_err(frame.id(), -32005, "Unknown fetch id"), extra),
                };
            }

            // Aliased names route (and record status) under their originals.
            let original = state
                .overrides
                .as_ref()
                .and_then(|set| set.original_for_alias(&name))
                .map(str::to_string)
                .unwrap_or_else(|| name.clone());

            let server = resolve_indexed(&state, IndexKind::Tool, &original).await;
            let Some(server) = server else {
                return json_response(
                    &rpc_err(frame.id(), -32601, &format!("Unknown tool: {name}")),
                    extra,
                );
            };

            let dispatch_body = if original != name {
                rewrite_tool_name(&body, &original).unwrap_or_else(|| body.clone())
            } else {
                body.clone()
            };

            dispatch_and_flush(
                &state,
                &server,
                &frame,
                &headers,
                &dispatch_body,
                extra,
                Some(original),
            )
            .await
        }

        other => {
            debug!(method = %other, "unsupported facade method");
            json_response(&rpc_err(frame.id(), -32601, "Method not found"), extra)
        }
    }
}

#[derive(Clone, Copy)]
enum IndexKind {
    Tool,
    Prompt,
    Resource,
}

/// Index lookup with one lazy rebuild on miss.
async fn resolve_indexed(state: &AppState, kind: IndexKind, key: &str) -> Option<String> {
    let pick = |indexes: &crate::app::Indexes| -> Option<String> {
        let table = match kind {
            IndexKind::Tool => &indexes.tools,
            IndexKind::Prompt => &indexes.prompts,
            IndexKind::Resource => &indexes.resources,
        };
        table.get(key).cloned()
    };

    if let Some(server) = pick(&*state.indexes.read().await) {
        return Some(server);
    }
    state.rebuild_index().await;
    pick(&*state.indexes.read().await)
}

/// Swap `params.name` in the raw body so a renamed tool reaches its
/// downstream under the original name.
fn rewrite_tool_name(body: &Bytes, original: &str) -> Option<Bytes> {
    let mut frame: Value = serde_json::from_slice(body).ok()?;
    let params = frame.get_mut("params")?.as_object_mut()?;
    params.insert("name".to_string(), Value::String(original.to_string()));
    serde_json::to_vec(&frame).ok().map(Bytes::from)
}

/// Forward via the adaptive probe, attach the dispatch headers, adapt
/// `tools/call` replies, and flush the recorded response (or a `-32004`
/// protocol error when every candidate was rejected).
async fn dispatch_and_flush(
    state: &AppState,
    server: &str,
    frame: &RpcFrame,
    headers: &HeaderMap,
    body: &Bytes,
    mut extra: ResponseHeaders,
    adapt_tool: Option<String>,
) -> Response {
    let (chosen, mut recorded) = try_dispatch(state, server, headers, body).await;

    extra.set(HDR_DISPATCHED_SERVER, server.to_string());
    extra.set(HDR_INTERNAL_PATH, chosen.clone());
    extra.set(
        HDR_INTERNAL_STATUS,
        recorded
            .status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string(),
    );

    if !recorded.is_success() {
        debug!(server, path = %chosen, status = %recorded.status, "dispatch exhausted");
        return json_response(
            &rpc_err(
                frame.id(),
                -32004,
                &format!("Upstream rejected all candidate endpoints for server {server}"),
            ),
            extra,
        );
    }

    if let Some(tool) = adapt_tool {
        recorded = adapt_recorded(state, server, &tool, recorded).await;
    }

    debug!(server, path = %chosen, status = %recorded.status, "dispatch ok");
    let mut response = recorded.into_http_response();
    extra.apply(&mut response);
    response
}

/// Run the result adapter over a recorded `tools/call` reply. Bodies the
/// adapter cannot parse are flushed untouched; a flaky downstream never
/// breaks the reply path.
async fn adapt_recorded(
    state: &AppState,
    server: &str,
    tool: &str,
    recorded: crate::dispatch::RecordedResponse,
) -> crate::dispatch::RecordedResponse {
    if !recorded.content_type.is_empty()
        && !recorded.content_type.starts_with("application/json")
    {
        return recorded;
    }
    let Ok(mut payload) = serde_json::from_slice::<Value>(&recorded.body) else {
        warn!(server, tool, "unparseable tools/call reply; skipping adaptation");
        return recorded;
    };

    let outcome = adapt_call_result(
        &state.homes,
        server,
        tool,
        state.overrides.as_ref(),
        &state.manifest,
        &mut payload,
    );

    if !outcome.modified {
        return recorded;
    }
    match serde_json::to_vec(&payload) {
        Ok(body) => crate::dispatch::RecordedResponse {
            body: Bytes::from(body),
            ..recorded
        },
        Err(err) => {
            warn!(server, tool, error = %err, "adapted payload re-encode failed");
            recorded
        }
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, head};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use stelae_core::catalog::{build_manifest_document, mount_path, ServerSnapshot};
use stelae_core::config::{Config, ManifestConfig, McpProxyConfig, ServerOptions};
use stelae_core::overrides::ToolOverrideSet;
use stelae_core::paths::{env_enabled, env_int, Homes};
use stelae_core::snapshots::{
    build_live_catalog_snapshot, build_live_descriptor_snapshot, write_snapshot_with_history,
};
use stelae_mcp::{Downstream, McpClientInfo};

use crate::dispatch::{self, MountedServer};
use crate::rpc;
use crate::sse;

/// One-shot fact that every downstream connect task has settled.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessSnapshot {
    pub ready_at: DateTime<Utc>,
    pub server_count: usize,
}

/// Name/uri lookup tables pointing each catalog entry at its owning server.
#[derive(Debug, Default)]
pub struct Indexes {
    pub tools: HashMap<String, String>,
    pub prompts: HashMap<String, String>,
    pub resources: HashMap<String, String>,
}

pub struct AppStateInner {
    pub proxy: McpProxyConfig,
    pub manifest: ManifestConfig,
    pub base_url: Url,
    pub overrides: Option<ToolOverrideSet>,
    pub homes: Homes,
    /// Random per-process token authorizing internal re-entry.
    pub internal_token: String,
    pub server_total: usize,
    pub servers: RwLock<BTreeMap<String, ServerSnapshot>>,
    pub mounts: RwLock<BTreeMap<String, MountedServer>>,
    pub indexes: RwLock<Indexes>,
    pub ready: watch::Sender<Option<ReadinessSnapshot>>,
}

pub type AppState = Arc<AppStateInner>;

/// Build the shared state: parse the base URL, load overrides (missing or
/// malformed files degrade to "no overrides" with a log line), mint the
/// internal re-entry token.
pub fn new_state(config: Config, homes: Homes) -> anyhow::Result<AppState> {
    let base_url = Url::parse(&config.mcp_proxy.base_url)
        .with_context(|| format!("parse baseUrl {:?}", config.mcp_proxy.base_url))?;
    let manifest = config.manifest_or_default();

    let overrides = load_overrides(&homes, &manifest);
    if let Some(set) = &overrides {
        for warning in &set.warnings {
            warn!(warning = %warning, "tool override sanitize");
        }
    }

    let (ready, _) = watch::channel(None);
    Ok(Arc::new(AppStateInner {
        server_total: config.mcp_servers.len(),
        proxy: config.mcp_proxy,
        manifest,
        base_url,
        overrides,
        homes,
        internal_token: Uuid::new_v4().to_string(),
        servers: RwLock::new(BTreeMap::new()),
        mounts: RwLock::new(BTreeMap::new()),
        indexes: RwLock::new(Indexes::default()),
        ready,
    }))
}

fn load_overrides(homes: &Homes, manifest: &ManifestConfig) -> Option<ToolOverrideSet> {
    let raw = manifest.tool_overrides_path.as_deref()?.trim();
    if raw.is_empty() {
        return None;
    }
    let path = match homes.resolve_guarded(raw) {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, path = raw, "override path rejected");
            return None;
        }
    };
    if !path.exists() {
        return None;
    }
    match stelae_core::overrides::load_tool_overrides(&path) {
        Ok(set) => set,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "override load failed; continuing without overrides");
            None
        }
    }
}

impl AppStateInner {
    pub fn mcp_path(&self) -> String {
        mount_path(self.base_url.path(), "mcp")
    }

    pub fn readiness(&self) -> Option<ReadinessSnapshot> {
        *self.ready.borrow()
    }

    /// Wait up to 2 seconds for the readiness snapshot. Returns `true` when
    /// the call actually blocked, so handlers can advertise the wait.
    pub async fn wait_for_ready(&self) -> bool {
        let mut rx = self.ready.subscribe();
        if rx.borrow().is_some() {
            return false;
        }
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.is_some())).await;
        true
    }

    /// Rebuild all three lookup tables from the current server snapshots.
    pub async fn rebuild_index(&self) {
        let servers = self.servers.read().await;
        let mut tools = HashMap::new();
        let mut prompts = HashMap::new();
        let mut resources = HashMap::new();
        for (name, snapshot) in servers.iter() {
            for tool in &snapshot.tools {
                tools.insert(tool.name.clone(), name.clone());
            }
            for prompt in &snapshot.prompts {
                prompts.insert(prompt.name.clone(), name.clone());
            }
            for resource in &snapshot.resources {
                resources.insert(resource.uri.clone(), name.clone());
            }
        }
        drop(servers);

        let mut indexes = self.indexes.write().await;
        indexes.tools = tools;
        indexes.prompts = prompts;
        indexes.resources = resources;
    }
}

/// Launch one connect task per configured downstream; when all settle,
/// publish the readiness snapshot and write the live catalog snapshots.
///
/// A connect failure is logged and the server skipped, unless the server was
/// configured with `panicIfInvalid`, which aborts the process.
pub async fn connect_all(
    state: AppState,
    downstreams: Vec<(String, ServerOptions, Arc<dyn Downstream>)>,
) {
    let client_info = McpClientInfo {
        name: state.proxy.name.clone(),
        version: state.proxy.version.clone(),
    };

    let mut tasks = JoinSet::new();
    for (name, options, endpoint) in downstreams {
        let state = state.clone();
        let client_info = client_info.clone();
        tasks.spawn(async move {
            info!(server = %name, "connecting");
            match endpoint.connect(&client_info).await {
                Ok(handshake) => {
                    let snapshot = ServerSnapshot {
                        name: name.clone(),
                        transport: endpoint.transport(),
                        tools: handshake.tools,
                        prompts: handshake.prompts,
                        resources: handshake.resources,
                        resource_templates: handshake.resource_templates,
                    };
                    info!(
                        server = %name,
                        tools = snapshot.tools.len(),
                        prompts = snapshot.prompts.len(),
                        resources = snapshot.resources.len(),
                        "connected"
                    );

                    let route = dispatch::route_for(state.base_url.path(), &name);
                    info!(server = %name, route = %route, "handling requests");
                    let mount = MountedServer {
                        name: name.clone(),
                        route,
                        endpoint,
                        auth_tokens: options.auth_tokens.clone(),
                        log_enabled: options
                            .log_enabled
                            .unwrap_or_else(|| env_enabled("STELAE_HTTP_LOG")),
                    };

                    let mut indexes = state.indexes.write().await;
                    for tool in &snapshot.tools {
                        indexes.tools.insert(tool.name.clone(), name.clone());
                    }
                    for prompt in &snapshot.prompts {
                        indexes.prompts.insert(prompt.name.clone(), name.clone());
                    }
                    for resource in &snapshot.resources {
                        indexes.resources.insert(resource.uri.clone(), name.clone());
                    }
                    drop(indexes);

                    state.servers.write().await.insert(name.clone(), snapshot);
                    state.mounts.write().await.insert(name.clone(), mount);
                    Ok(())
                }
                Err(err) => {
                    warn!(server = %name, error = %err, "connect failed");
                    if options.panic_if_invalid.unwrap_or(false) {
                        Err(err.context(format!("connect to required server {name}")))
                    } else {
                        Ok(())
                    }
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(error = %err, "failed to initialize clients");
                std::process::exit(1);
            }
            Err(err) => {
                error!(error = %err, "connect task panicked");
                std::process::exit(1);
            }
        }
    }

    let snapshot = ReadinessSnapshot {
        ready_at: Utc::now(),
        server_count: state.server_total,
    };
    let _ = state.ready.send(Some(snapshot));
    info!(
        servers = snapshot.server_count,
        ready_at = %snapshot.ready_at.to_rfc3339(),
        "facade ready"
    );

    write_live_snapshots(&state).await;
}

/// Persist the live catalog and descriptor snapshots; never fatal.
async fn write_live_snapshots(state: &AppState) {
    let history = env_int("STELAE_CATALOG_HISTORY", 5).max(0) as usize;
    let generated_at = Utc::now();
    let servers = state.servers.read().await;

    if let Some(path) = state.manifest.live_catalog_path.as_deref() {
        let payload = build_live_catalog_snapshot(
            &state.proxy,
            &servers,
            state.overrides.as_ref(),
            generated_at,
        );
        if let Err(err) =
            write_snapshot_with_history(&state.homes, path, &payload, history, generated_at)
        {
            warn!(error = %err, path, "live catalog snapshot failed");
        }
    }
    if let Some(path) = state.manifest.live_descriptors_path.as_deref() {
        let payload = build_live_descriptor_snapshot(&servers, generated_at);
        if let Err(err) =
            write_snapshot_with_history(&state.homes, path, &payload, history, generated_at)
        {
            warn!(error = %err, path, "live descriptor snapshot failed");
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mcp_path = state.mcp_path();
    Router::new()
        .route("/.well-known/mcp/manifest.json", get(manifest_handler))
        .route(
            &mcp_path,
            head(sse::facade_head)
                .get(sse::facade_sse)
                .post(rpc::facade_post)
                .options(facade_options),
        )
        .fallback(dispatch::mounted_server_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

async fn manifest_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok());
    let servers = state.servers.read().await;
    let doc = build_manifest_document(
        &state.manifest,
        &state.proxy,
        &state.base_url,
        host,
        &servers,
        state.overrides.as_ref(),
    );
    Json(doc).into_response()
}

async fn facade_options() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("allow", "GET, HEAD, POST, OPTIONS")
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

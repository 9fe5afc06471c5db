use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::info;

use stelae_mcp::Downstream;

use crate::app::AppState;
use crate::middleware::{authorize, INTERNAL_HEADER};

/// A downstream registered under `/<base>/<name>/`, consulted by both the
/// external fallback route and the facade's internal re-entry.
#[derive(Clone)]
pub struct MountedServer {
    pub name: String,
    /// Mount prefix with trailing slash, e.g. `/base/fs/`.
    pub route: String,
    pub endpoint: Arc<dyn Downstream>,
    pub auth_tokens: Vec<String>,
    pub log_enabled: bool,
}

/// Build a clean mount route like `/base/name/` with a trailing slash.
pub fn route_for(base_path: &str, name: &str) -> String {
    let base = base_path.trim_matches('/');
    let route = if base.is_empty() {
        format!("/{name}")
    } else {
        format!("/{base}/{name}")
    };
    format!("{route}/")
}

/// Captured reply from a mounted downstream, replayed to the caller later.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: Bytes,
}

impl RecordedResponse {
    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: "text/plain".to_string(),
            body: Bytes::from_static(b"Not Found"),
        }
    }

    pub fn is_success(&self) -> bool {
        let code = self.status.as_u16();
        (200..=204).contains(&code)
    }

    /// Flush to an HTTP response; JSON is assumed when the downstream did not
    /// say otherwise.
    pub fn into_http_response(self) -> Response {
        let content_type = if self.content_type.is_empty() {
            "application/json".to_string()
        } else {
            self.content_type
        };
        Response::builder()
            .status(self.status)
            .header("content-type", content_type)
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Serve one request against a mounted downstream: per-mount auth, optional
/// request log, then forward iff the sub-path is one the downstream mounts.
pub async fn serve_mounted(
    state: &AppState,
    mount: &MountedServer,
    suffix: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> RecordedResponse {
    if !authorize(headers, &mount.auth_tokens, &state.internal_token) {
        return RecordedResponse {
            status: StatusCode::UNAUTHORIZED,
            content_type: "text/plain".to_string(),
            body: Bytes::from_static(b"Unauthorized"),
        };
    }
    if mount.log_enabled {
        info!(server = %mount.name, path = suffix, "mounted dispatch");
    }

    let accepted = mount
        .endpoint
        .mount_suffixes()
        .iter()
        .any(|s| s == suffix);
    if !accepted {
        return RecordedResponse::not_found();
    }

    match mount.endpoint.forward(body).await {
        Ok(forwarded) => RecordedResponse {
            status: StatusCode::from_u16(forwarded.status)
                .unwrap_or(StatusCode::BAD_GATEWAY),
            content_type: forwarded.content_type,
            body: Bytes::from(forwarded.body),
        },
        Err(err) => RecordedResponse {
            status: StatusCode::BAD_GATEWAY,
            content_type: "text/plain".to_string(),
            body: Bytes::from(format!("downstream error: {err}")),
        },
    }
}

/// Adaptive-path dispatch: replay `body` against the server's mount at each
/// candidate sub-path in order, first 200..=204 wins. Returns the tried path
/// (the last one on exhaustion) and the recorded response.
pub async fn try_dispatch(
    state: &AppState,
    server_name: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> (String, RecordedResponse) {
    let mounts = state.mounts.read().await;
    let Some(mount) = mounts.get(server_name) else {
        return (String::new(), RecordedResponse::not_found());
    };

    let mut internal_headers = headers.clone();
    internal_headers.insert(
        INTERNAL_HEADER,
        HeaderValue::from_str(&state.internal_token)
            .unwrap_or(HeaderValue::from_static("")),
    );
    if !internal_headers.contains_key("content-type") {
        internal_headers.insert("content-type", HeaderValue::from_static("application/json"));
    }

    let trimmed = mount.route.trim_end_matches('/').to_string();
    let candidates: Vec<(String, String)> = vec![
        (format!("{trimmed}/mcp"), "mcp".to_string()),
        (mount.route.clone(), String::new()),
        (trimmed.clone(), String::new()),
        (format!("{trimmed}/message"), "message".to_string()),
        (format!("{trimmed}/messages"), "messages".to_string()),
        (format!("{trimmed}/send"), "send".to_string()),
        (format!("{trimmed}/rpc"), "rpc".to_string()),
        (format!("{trimmed}/jsonrpc"), "jsonrpc".to_string()),
    ];

    for (path, suffix) in &candidates {
        let recorded = serve_mounted(state, mount, suffix, &internal_headers, body).await;
        if recorded.is_success() {
            return (path.clone(), recorded);
        }
    }

    let last = candidates
        .last()
        .map(|(path, _)| path.clone())
        .unwrap_or_default();
    (last, RecordedResponse::not_found())
}

/// Fallback route: external traffic landing on a per-server mount.
pub async fn mounted_server_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    uri: axum::http::Uri,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = uri.path().to_string();

    let mounts = state.mounts.read().await;
    let resolved = mounts.values().find_map(|mount| {
        let trimmed = mount.route.trim_end_matches('/');
        if path == mount.route || path == trimmed {
            return Some((mount.clone(), String::new()));
        }
        path.strip_prefix(&mount.route)
            .map(|suffix| (mount.clone(), suffix.trim_end_matches('/').to_string()))
    });
    drop(mounts);

    match resolved {
        Some((mount, suffix)) => serve_mounted(&state, &mount, &suffix, &headers, &body)
            .await
            .into_http_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_for_shapes() {
        assert_eq!(route_for("", "fs"), "/fs/");
        assert_eq!(route_for("/", "fs"), "/fs/");
        assert_eq!(route_for("/base", "fs"), "/base/fs/");
        assert_eq!(route_for("/base/", "fs"), "/base/fs/");
    }

    #[test]
    fn recorded_success_window() {
        for code in [200u16, 202, 204] {
            let rec = RecordedResponse {
                status: StatusCode::from_u16(code).unwrap(),
                content_type: String::new(),
                body: Bytes::new(),
            };
            assert!(rec.is_success(), "status {code}");
        }
        let rec = RecordedResponse::not_found();
        assert!(!rec.is_success());
    }
}

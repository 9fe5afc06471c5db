use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::ManifestConfig;
use crate::overrides::{OverrideFile, ToolOverrideSet, OVERRIDE_SCHEMA_VERSION};
use crate::paths::Homes;
use crate::snapshots::write_json_atomic;
use crate::util::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    PassThrough,
    Declared,
    Generic,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::PassThrough => "pass_through",
            AdapterKind::Declared => "declared",
            AdapterKind::Generic => "generic",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdaptOutcome {
    pub modified: bool,
    pub adapter: AdapterKind,
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolStatusEntry {
    pub last_adapter: String,
    pub consecutive_generic_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: i64,
}

pub type StatusMap = BTreeMap<String, BTreeMap<String, ToolStatusEntry>>;

/// Load the status file; missing files and parse failures degrade to empty.
pub fn load_status(path: &Path) -> StatusMap {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return StatusMap::new(),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "status read failed");
            return StatusMap::new();
        }
    };
    match serde_json::from_slice(&data) {
        Ok(map) => map,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "status parse failed");
            StatusMap::new()
        }
    }
}

fn write_status(path: &Path, status: &StatusMap) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_json_atomic(path, &serde_json::to_value(status)?)
}

fn set_status(path: &Path, server: &str, tool: &str, adapter: AdapterKind, consecutive: u32) {
    let mut status = load_status(path);
    status.entry(server.to_string()).or_default().insert(
        tool.to_string(),
        ToolStatusEntry {
            last_adapter: adapter.as_str().to_string(),
            consecutive_generic_count: consecutive,
            note: None,
            updated_at: Utc::now().timestamp(),
        },
    );
    if let Err(err) = write_status(path, &status) {
        warn!(error = %err, path = %path.display(), "status write failed");
    }
}

fn previous_entry(path: Option<&Path>, server: &str, tool: &str) -> Option<ToolStatusEntry> {
    let path = path?;
    load_status(path)
        .get(server)
        .and_then(|tools| tools.get(tool))
        .cloned()
}

/// Resolve a manifest-configured state path through the path guard; guard
/// rejections disable persistence for this call rather than failing it.
fn guarded_path(homes: &Homes, configured: Option<&str>, what: &str) -> Option<PathBuf> {
    let raw = configured?.trim();
    if raw.is_empty() {
        return None;
    }
    match homes.resolve_guarded(raw) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!(error = %err, path = raw, "{what} path rejected; persistence disabled");
            None
        }
    }
}

/// Persist a learned output schema under
/// `servers.<server>.tools.<tool>.outputSchema` in the overrides file,
/// creating missing parents and bumping `schemaVersion` to at least 2.
fn write_server_tool_output_schema(
    path: &Path,
    server: &str,
    tool: &str,
    schema: &Value,
) -> anyhow::Result<()> {
    let mut file: OverrideFile = match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => OverrideFile::default(),
    };

    let fragment = file.servers.entry(server.to_string()).or_default();
    let cfg = fragment.tools.entry(tool.to_string()).or_insert_with(|| {
        crate::overrides::ToolOverrideConfig {
            enabled: Some(true),
            ..Default::default()
        }
    });
    cfg.output_schema = Some(schema.clone());
    file.schema_version = Some(file.schema_version.unwrap_or(0).max(OVERRIDE_SCHEMA_VERSION));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_json_atomic(path, &serde_json::to_value(&file)?)
}

/// Normalize a `tools/call` reply into `structuredContent`.
///
/// First match wins: already-structured pass-through, declared single-string
/// wrap, declared metadata/content split, generic `{result: text}` fallback.
/// Status bookkeeping and override persistence happen here as well; any
/// persistence failure is logged and the adaptation still succeeds.
pub fn adapt_call_result(
    homes: &Homes,
    server: &str,
    tool: &str,
    overrides: Option<&ToolOverrideSet>,
    manifest: &ManifestConfig,
    payload: &mut Value,
) -> AdaptOutcome {
    let status_path = guarded_path(homes, manifest.tool_schema_status_path.as_deref(), "status");
    let overrides_path = guarded_path(homes, manifest.tool_overrides_path.as_deref(), "overrides");

    let Some(result) = payload.get_mut("result").and_then(Value::as_object_mut) else {
        return AdaptOutcome {
            modified: false,
            adapter: AdapterKind::PassThrough,
            schema: None,
        };
    };

    let previous = previous_entry(status_path.as_deref(), server, tool);
    let prev_adapter = previous.as_ref().map(|e| e.last_adapter.clone());
    let prev_streak = previous.map(|e| e.consecutive_generic_count).unwrap_or(0);

    if result
        .get("structuredContent")
        .map(Value::is_object)
        .unwrap_or(false)
    {
        if let Some(path) = &status_path {
            set_status(path, server, tool, AdapterKind::PassThrough, 0);
        }
        log_adaptation(server, tool, AdapterKind::PassThrough, prev_adapter.as_deref(), 0, None);
        return AdaptOutcome {
            modified: false,
            adapter: AdapterKind::PassThrough,
            schema: None,
        };
    }

    let text = extract_text_content(result);
    let declared = overrides.and_then(|set| set.declared_output_schema(server, tool));

    if let Some(decl) = &declared {
        if let Some(field) = single_string_field(decl) {
            result.insert("structuredContent".to_string(), json!({ field: text }));
            if let Some(path) = &status_path {
                set_status(path, server, tool, AdapterKind::Declared, 0);
            }
            log_adaptation(server, tool, AdapterKind::Declared, prev_adapter.as_deref(), 0, Some(decl));
            return AdaptOutcome {
                modified: true,
                adapter: AdapterKind::Declared,
                schema: Some(decl.clone()),
            };
        }
        if is_metadata_content_schema(decl) {
            result.insert("structuredContent".to_string(), parse_metadata_content(&text));
            if let Some(path) = &status_path {
                set_status(path, server, tool, AdapterKind::Declared, 0);
            }
            log_adaptation(server, tool, AdapterKind::Declared, prev_adapter.as_deref(), 0, Some(decl));
            return AdaptOutcome {
                modified: true,
                adapter: AdapterKind::Declared,
                schema: Some(decl.clone()),
            };
        }
    }

    let generic = json!({
        "type": "object",
        "properties": { "result": { "type": "string" } },
        "required": ["result"]
    });
    result.insert("structuredContent".to_string(), json!({ "result": text }));

    let streak = prev_streak + 1;
    if let Some(path) = &status_path {
        set_status(path, server, tool, AdapterKind::Generic, streak);
    }
    if declared.is_none() || streak >= 2 {
        if let Some(path) = &overrides_path {
            if let Err(err) = write_server_tool_output_schema(path, server, tool, &generic) {
                warn!(error = %err, server, tool, "generic schema persistence failed");
            }
        }
    }
    log_adaptation(server, tool, AdapterKind::Generic, prev_adapter.as_deref(), streak, Some(&generic));

    AdaptOutcome {
        modified: true,
        adapter: AdapterKind::Generic,
        schema: Some(generic),
    }
}

fn log_adaptation(
    server: &str,
    tool: &str,
    adapter: AdapterKind,
    prev_adapter: Option<&str>,
    streak: u32,
    schema: Option<&Value>,
) {
    let state = if prev_adapter != Some(adapter.as_str()) {
        "started"
    } else if adapter == AdapterKind::Generic {
        "failed"
    } else {
        "succeeded"
    };
    let schema_hash = schema
        .and_then(|s| serde_json::to_vec(s).ok())
        .map(|bytes| sha256_hex(&bytes))
        .unwrap_or_default();
    info!(
        state,
        server,
        tool,
        adapter = adapter.as_str(),
        streak,
        schema_hash,
        "tool result adaptation"
    );
}

/// First non-empty `text` block in `result.content`, else the first raw
/// string element, else empty.
pub fn extract_text_content(result: &Map<String, Value>) -> String {
    let Some(Value::Array(content)) = result.get("content") else {
        return String::new();
    };
    for item in content {
        match item {
            Value::Object(block) => {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            return text.to_string();
                        }
                    }
                }
            }
            Value::String(raw) if !raw.is_empty() => return raw.clone(),
            _ => {}
        }
    }
    String::new()
}

/// A declared schema shaped `{ properties: { <field>: { type: "string" } } }`
/// whose `required` is absent or names only that field.
pub fn single_string_field(schema: &Value) -> Option<String> {
    let props = schema.get("properties")?.as_object()?;
    if props.len() != 1 {
        return None;
    }
    let (name, prop) = props.iter().next()?;
    if prop.get("type").and_then(Value::as_str) != Some("string") {
        return None;
    }
    if let Some(Value::Array(required)) = schema.get("required") {
        for entry in required {
            if entry.as_str() != Some(name) {
                return None;
            }
        }
    }
    Some(name.clone())
}

/// Declared schema whose properties carry `metadata: object` and
/// `content: string`.
pub fn is_metadata_content_schema(schema: &Value) -> bool {
    let Some(props) = schema.get("properties").and_then(Value::as_object) else {
        return false;
    };
    let meta_ok = props
        .get("metadata")
        .and_then(|m| m.get("type"))
        .and_then(Value::as_str)
        == Some("object");
    let content_ok = props
        .get("content")
        .and_then(|c| c.get("type"))
        .and_then(Value::as_str)
        == Some("string");
    meta_ok && content_ok
}

/// Split a `METADATA:`-prefixed payload into `{metadata, content}`; without
/// the prefix (or on parse failure) the whole text lands in `content` with a
/// marker metadata object.
pub fn parse_metadata_content(text: &str) -> Value {
    let mut out = json!({
        "metadata": { "adapter": "declared:metadata-content" },
        "content": text,
    });
    if let Some(body) = text.strip_prefix("METADATA:") {
        if let Some(split) = body.find("\n\n") {
            let meta_raw = body[..split].trim();
            let content = body[split + 2..].trim();
            if let Ok(parsed) = serde_json::from_str::<Value>(meta_raw) {
                if parsed.is_object() {
                    out["metadata"] = parsed;
                }
            }
            out["content"] = Value::String(content.to_string());
        }
    }
    out
}

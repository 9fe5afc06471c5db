use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use url::Url;

use stelae_mcp::{Prompt, Resource, ResourceTemplate, Tool, TransportKind, PROTOCOL_VERSION};

use crate::annotations::normalize_tool_annotations;
use crate::config::{ManifestConfig, McpProxyConfig};
use crate::facade::{
    fetch_tool_descriptor, search_tool_descriptor, FACADE_FETCH_TOOL, FACADE_SEARCH_TOOL,
};
use crate::overrides::{self, ToolOverrideConfig, ToolOverrideSet};

/// Synthetic contributing-server name for injected facade tools.
pub const FACADE_SERVER: &str = "facade";

/// What one downstream reported at connect time. Immutable for the lifetime
/// of the process once stored.
#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
}

impl ServerSnapshot {
    pub fn new(name: impl Into<String>, transport: TransportKind) -> Self {
        Self {
            name: name.into(),
            transport,
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
        }
    }
}

/// Catalog entry under construction: merged descriptor plus the set of
/// servers that contributed to it.
struct AggregatedTool {
    descriptor: Map<String, Value>,
    servers: BTreeSet<String>,
}

impl AggregatedTool {
    fn new(descriptor: Map<String, Value>, server: &str) -> Self {
        let mut servers = BTreeSet::new();
        servers.insert(server.to_string());
        Self { descriptor, servers }
    }

    fn server_list(&self) -> Vec<Value> {
        self.servers
            .iter()
            .map(|s| Value::String(s.clone()))
            .collect()
    }
}

/// Raw descriptor for one downstream tool: name, non-empty description, the
/// schemas exactly as reported, and normalized annotations.
pub fn tool_descriptor_from_server(tool: &Tool) -> Map<String, Value> {
    let mut descriptor = Map::new();
    descriptor.insert("name".to_string(), Value::String(tool.name.clone()));
    if let Some(desc) = tool.description.as_ref().filter(|d| !d.is_empty()) {
        descriptor.insert("description".to_string(), Value::String(desc.clone()));
    }
    if let Some(schema) = tool.input_schema.as_ref().filter(|s| !s.is_null()) {
        descriptor.insert("inputSchema".to_string(), schema.clone());
    }
    if let Some(schema) = tool.output_schema.as_ref().filter(|s| !s.is_null()) {
        descriptor.insert("outputSchema".to_string(), schema.clone());
    }
    descriptor.insert(
        "annotations".to_string(),
        Value::Object(normalize_tool_annotations(tool.annotations.as_ref())),
    );
    descriptor
}

/// Overlay a server-supplied descriptor on a facade default: default fields
/// fill the gaps, non-empty server fields win.
pub fn merge_with_facade_defaults(
    base: Map<String, Value>,
    fallback: Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = fallback;
    for (key, value) in base {
        if value.is_null() {
            continue;
        }
        if matches!(&value, Value::String(s) if s.is_empty()) {
            continue;
        }
        merged.insert(key, value);
    }
    merged
}

/// Rewrite a connector-style `fetch` input schema keyed by `url` so the
/// facade's id-based lookup is reflected: `required` becomes `["id"]` and an
/// `id` property is added.
pub fn ensure_fetch_id_schema(descriptor: &mut Map<String, Value>) {
    let Some(Value::Object(schema)) = descriptor.get_mut("inputSchema") else {
        return;
    };
    let url_only = matches!(
        schema.get("required"),
        Some(Value::Array(req)) if req.len() == 1 && req[0] == Value::String("url".to_string())
    );
    if url_only {
        schema.insert("required".to_string(), json!(["id"]));
    }
    if let Some(Value::Object(props)) = schema.get_mut("properties") {
        if !props.contains_key("id") {
            props.insert("id".to_string(), json!({ "title": "Id", "type": "string" }));
        }
    }
}

/// Pairwise descriptor merge: scalars keep the first non-empty value,
/// annotation booleans follow "any-true wins, false only fills unset".
fn merge_tool_descriptors(base: &mut Map<String, Value>, extra: Map<String, Value>) {
    for (key, value) in extra {
        if key == "annotations" {
            merge_annotation_values(base, value);
            continue;
        }
        let missing = match base.get(&key) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            base.insert(key, value);
        }
    }
}

fn merge_annotation_values(base: &mut Map<String, Value>, extra: Value) {
    let Value::Object(extra_ann) = extra else {
        return;
    };
    let entry = base
        .entry("annotations".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let Value::Object(ann) = entry else {
        return;
    };
    for (key, value) in extra_ann {
        match value {
            Value::Bool(true) => {
                ann.insert(key, Value::Bool(true));
            }
            Value::Bool(false) => {
                ann.entry(key).or_insert(Value::Bool(false));
            }
            Value::String(s) if !s.is_empty() => {
                let fill = match ann.get(&key) {
                    None | Some(Value::Null) => true,
                    Some(Value::String(existing)) => existing.is_empty(),
                    Some(_) => false,
                };
                if fill {
                    ann.insert(key, Value::String(s));
                }
            }
            _ => {}
        }
    }
}

fn apply_config_to_descriptor(
    descriptor: &mut Map<String, Value>,
    cfg: &ToolOverrideConfig,
    allow_rename: bool,
) {
    if let Some(ann_cfg) = &cfg.annotations {
        let entry = descriptor
            .entry("annotations".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(ann) = entry {
            if let Some(title) = &ann_cfg.title {
                ann.insert("title".to_string(), Value::String(title.clone()));
            }
            if let Some(v) = ann_cfg.read_only_hint {
                ann.insert("readOnlyHint".to_string(), Value::Bool(v));
            }
            if let Some(v) = ann_cfg.destructive_hint {
                ann.insert("destructiveHint".to_string(), Value::Bool(v));
            }
            if let Some(v) = ann_cfg.idempotent_hint {
                ann.insert("idempotentHint".to_string(), Value::Bool(v));
            }
            if let Some(v) = ann_cfg.open_world_hint {
                ann.insert("openWorldHint".to_string(), Value::Bool(v));
            }
        }
    }
    if let Some(desc) = &cfg.description {
        descriptor.insert("description".to_string(), Value::String(desc.clone()));
    }
    if let Some(schema) = &cfg.input_schema {
        descriptor.insert("inputSchema".to_string(), schema.clone());
    }
    if let Some(schema) = &cfg.output_schema {
        descriptor.insert("outputSchema".to_string(), schema.clone());
    }
    if allow_rename {
        if let Some(alias) = &cfg.name {
            descriptor.insert("name".to_string(), Value::String(alias.clone()));
        }
    }
}

/// Override post-processing for one catalog entry: the master wildcard first
/// (annotations/description/schemas, never a rename), then the per-tool
/// override, which may rename.
pub fn apply_tool_override(
    original: &str,
    mut descriptor: Map<String, Value>,
    set: Option<&ToolOverrideSet>,
) -> Map<String, Value> {
    let Some(set) = set else {
        return descriptor;
    };
    if let Some(star) = set.tool_overrides.get("*") {
        apply_config_to_descriptor(&mut descriptor, star, false);
    }
    if let Some(cfg) = set.tool_overrides.get(original) {
        apply_config_to_descriptor(&mut descriptor, cfg, true);
    }
    descriptor
}

/// Produce the deduplicated, override-applied tool catalog, sorted by final
/// name. The facade `search`/`fetch` tools are always present unless
/// disabled by overrides.
pub fn collect_tools(
    servers: &BTreeMap<String, ServerSnapshot>,
    overrides: Option<&ToolOverrideSet>,
) -> Vec<Map<String, Value>> {
    let mut seen: BTreeMap<String, AggregatedTool> = BTreeMap::new();

    for (server_name, snapshot) in servers {
        if !overrides::server_enabled(overrides, server_name) {
            continue;
        }
        for tool in &snapshot.tools {
            if tool.name.is_empty() {
                continue;
            }
            if !overrides::tool_enabled(overrides, server_name, &tool.name) {
                continue;
            }
            let mut descriptor = tool_descriptor_from_server(tool);
            if tool.name == FACADE_SEARCH_TOOL {
                descriptor = merge_with_facade_defaults(descriptor, search_tool_descriptor());
            } else if tool.name == FACADE_FETCH_TOOL {
                descriptor = merge_with_facade_defaults(descriptor, fetch_tool_descriptor());
                ensure_fetch_id_schema(&mut descriptor);
            }
            match seen.get_mut(&tool.name) {
                Some(entry) => {
                    merge_tool_descriptors(&mut entry.descriptor, descriptor);
                    entry.servers.insert(server_name.clone());
                }
                None => {
                    seen.insert(
                        tool.name.clone(),
                        AggregatedTool::new(descriptor, server_name),
                    );
                }
            }
        }
    }

    if !seen.contains_key(FACADE_SEARCH_TOOL)
        && overrides::tool_enabled(overrides, FACADE_SERVER, FACADE_SEARCH_TOOL)
    {
        seen.insert(
            FACADE_SEARCH_TOOL.to_string(),
            AggregatedTool::new(search_tool_descriptor(), FACADE_SERVER),
        );
    }
    if !seen.contains_key(FACADE_FETCH_TOOL)
        && overrides::tool_enabled(overrides, FACADE_SERVER, FACADE_FETCH_TOOL)
    {
        let mut descriptor = fetch_tool_descriptor();
        ensure_fetch_id_schema(&mut descriptor);
        seen.insert(
            FACADE_FETCH_TOOL.to_string(),
            AggregatedTool::new(descriptor, FACADE_SERVER),
        );
    }

    let mut result: Vec<Map<String, Value>> = Vec::with_capacity(seen.len());
    for (original, entry) in seen {
        let servers_list = entry.server_list();
        let mut descriptor = apply_tool_override(&original, entry.descriptor, overrides);
        if !descriptor.contains_key("annotations") {
            descriptor.insert(
                "annotations".to_string(),
                Value::Object(normalize_tool_annotations(None)),
            );
        }
        let primary = servers_list
            .first()
            .cloned()
            .unwrap_or(Value::String(String::new()));
        descriptor.insert(
            "x-stelae".to_string(),
            json!({ "servers": servers_list, "primaryServer": primary }),
        );
        result.push(descriptor);
    }

    result.sort_by(|a, b| descriptor_name(a).cmp(descriptor_name(b)));
    result
}

fn descriptor_name(descriptor: &Map<String, Value>) -> &str {
    descriptor.get("name").and_then(Value::as_str).unwrap_or("")
}

pub fn collect_prompts(servers: &BTreeMap<String, ServerSnapshot>) -> Vec<Value> {
    let mut prompts = Vec::new();
    for snapshot in servers.values() {
        for prompt in &snapshot.prompts {
            let mut item = Map::new();
            item.insert("name".to_string(), Value::String(prompt.name.clone()));
            if let Some(desc) = prompt.description.as_ref().filter(|d| !d.is_empty()) {
                item.insert("description".to_string(), Value::String(desc.clone()));
            }
            if !prompt.arguments.is_empty() {
                item.insert(
                    "arguments".to_string(),
                    serde_json::to_value(&prompt.arguments).unwrap_or(Value::Null),
                );
            }
            prompts.push(Value::Object(item));
        }
    }
    prompts
}

pub fn collect_resources(servers: &BTreeMap<String, ServerSnapshot>) -> Vec<Value> {
    let mut resources = Vec::new();
    for snapshot in servers.values() {
        for resource in &snapshot.resources {
            let mut item = Map::new();
            item.insert("uri".to_string(), Value::String(resource.uri.clone()));
            item.insert("name".to_string(), Value::String(resource.name.clone()));
            if let Some(desc) = resource.description.as_ref().filter(|d| !d.is_empty()) {
                item.insert("description".to_string(), Value::String(desc.clone()));
            }
            if let Some(mime) = resource.mime_type.as_ref().filter(|m| !m.is_empty()) {
                item.insert("mimeType".to_string(), Value::String(mime.clone()));
            }
            resources.push(Value::Object(item));
        }
    }
    resources
}

pub fn collect_resource_templates(servers: &BTreeMap<String, ServerSnapshot>) -> Vec<Value> {
    let mut templates = Vec::new();
    for snapshot in servers.values() {
        for template in &snapshot.resource_templates {
            let mut item = Map::new();
            item.insert("name".to_string(), Value::String(template.name.clone()));
            if let Some(desc) = template.description.as_ref().filter(|d| !d.is_empty()) {
                item.insert("description".to_string(), Value::String(desc.clone()));
            }
            if let Some(mime) = template.mime_type.as_ref().filter(|m| !m.is_empty()) {
                item.insert("mimeType".to_string(), Value::String(mime.clone()));
            }
            if let Some(tpl) = template.uri_template.as_ref().filter(|t| !t.is_empty()) {
                item.insert("uriTemplate".to_string(), Value::String(tpl.clone()));
            }
            templates.push(Value::Object(item));
        }
    }
    templates
}

/// Initialize result for the facade: protocol version, server info, the
/// capability keys for every non-empty catalog, and the catalogs themselves.
pub fn build_initialize_result(
    proxy: &McpProxyConfig,
    servers: &BTreeMap<String, ServerSnapshot>,
    overrides: Option<&ToolOverrideSet>,
) -> Value {
    let tools = collect_tools(servers, overrides);
    let prompts = collect_prompts(servers);
    let resources = collect_resources(servers);
    let resource_templates = collect_resource_templates(servers);

    let mut capabilities = Map::new();
    if !tools.is_empty() {
        capabilities.insert("tools".to_string(), json!({ "listChanged": false }));
    }
    if !prompts.is_empty() {
        capabilities.insert("prompts".to_string(), json!({ "listChanged": false }));
    }
    if !resources.is_empty() || !resource_templates.is_empty() {
        capabilities.insert(
            "resources".to_string(),
            json!({ "subscribe": false, "listChanged": false }),
        );
    }

    let mut result = Map::new();
    result.insert(
        "protocolVersion".to_string(),
        Value::String(PROTOCOL_VERSION.to_string()),
    );
    result.insert(
        "serverInfo".to_string(),
        json!({ "name": proxy.name, "version": proxy.version }),
    );
    result.insert("capabilities".to_string(), Value::Object(capabilities));
    result.insert(
        "tools".to_string(),
        Value::Array(tools.into_iter().map(Value::Object).collect()),
    );
    if !prompts.is_empty() {
        result.insert("prompts".to_string(), Value::Array(prompts));
    }
    if !resources.is_empty() {
        result.insert("resources".to_string(), Value::Array(resources));
    }
    if !resource_templates.is_empty() {
        result.insert(
            "resourceTemplates".to_string(),
            Value::Array(resource_templates),
        );
    }
    Value::Object(result)
}

/// Join a mount prefix and a segment into a clean absolute path.
pub fn mount_path(base_path: &str, segment: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let joined = if segment.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{segment}")
    };
    if joined.starts_with('/') {
        joined
    } else {
        format!("/{joined}")
    }
}

/// The `/.well-known/mcp/manifest.json` discovery document.
pub fn build_manifest_document(
    manifest: &ManifestConfig,
    proxy: &McpProxyConfig,
    base_url: &Url,
    request_host: Option<&str>,
    servers: &BTreeMap<String, ServerSnapshot>,
    overrides: Option<&ToolOverrideSet>,
) -> Value {
    let endpoint_path = mount_path(base_url.path(), "mcp");
    let scheme = base_url.scheme();
    let host = match request_host.filter(|h| !h.is_empty()) {
        Some(h) => h.to_string(),
        None => {
            let mut h = base_url.host_str().unwrap_or("").to_string();
            if let Some(port) = base_url.port() {
                h = format!("{h}:{port}");
            }
            h
        }
    };
    let endpoint_url = format!("{scheme}://{host}{endpoint_path}");

    let tools: Vec<Value> = collect_tools(servers, overrides)
        .into_iter()
        .map(Value::Object)
        .collect();
    let prompts = collect_prompts(servers);

    let mut resources: Vec<Value> = manifest.resources.clone();
    resources.extend(collect_resources(servers));
    let templates = collect_resource_templates(servers);

    let server_name = manifest
        .server_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| proxy.name.clone());

    let mut payload = Map::new();
    payload.insert("name".to_string(), Value::String(manifest.name.clone()));
    payload.insert("version".to_string(), Value::String(manifest.version.clone()));
    payload.insert(
        "description".to_string(),
        Value::String(manifest.description.clone()),
    );
    payload.insert("tools".to_string(), Value::Array(tools));
    payload.insert("prompts".to_string(), Value::Array(prompts));
    payload.insert("resources".to_string(), Value::Array(resources));
    payload.insert("endpoint".to_string(), Value::String(endpoint_path));
    payload.insert("endpointURL".to_string(), Value::String(endpoint_url.clone()));
    if !templates.is_empty() {
        payload.insert("resourceTemplates".to_string(), Value::Array(templates));
    }
    payload.insert(
        "servers".to_string(),
        json!([{
            "name": server_name,
            "transport": "streamable-http",
            "url": endpoint_url,
            "version": proxy.version,
        }]),
    );
    Value::Object(payload)
}

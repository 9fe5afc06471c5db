use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version stamped on every persisted override file.
pub const OVERRIDE_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationOverrideConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_world_hint: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOverrideConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<AnnotationOverrideConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideFragment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolOverrideConfig>,
}

/// On-disk shape of `tool_overrides.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, ToolOverrideConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<OverrideFragment>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servers: BTreeMap<String, OverrideFragment>,
}

/// Sanitized, queryable override rules.
///
/// `tool_overrides` is the union of the file's top-level, master, and
/// per-server tool entries; the per-scope fragments are kept separately for
/// the enable/disable precedence walk. All maps are `BTreeMap` so sanitize
/// visits keys in sorted order and alias collisions resolve deterministically
/// across loads.
#[derive(Debug, Clone, Default)]
pub struct ToolOverrideSet {
    pub tool_overrides: BTreeMap<String, ToolOverrideConfig>,
    pub master: Option<OverrideFragment>,
    pub servers: BTreeMap<String, OverrideFragment>,
    pub aliases: BTreeMap<String, String>,
    pub renamed: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl ToolOverrideSet {
    pub fn from_file(file: OverrideFile) -> Option<Self> {
        let mut set = ToolOverrideSet::default();
        merge_override_into(&mut set.tool_overrides, &file.tools);
        for (name, fragment) in file.servers {
            merge_override_into(&mut set.tool_overrides, &fragment.tools);
            set.servers.insert(name, fragment);
        }
        if let Some(master) = file.master {
            merge_override_into(&mut set.tool_overrides, &master.tools);
            set.master = Some(master);
        }
        sanitize(&mut set);
        if set.is_empty() {
            return None;
        }
        Some(set)
    }

    pub fn is_empty(&self) -> bool {
        self.tool_overrides.is_empty() && self.master.is_none() && self.servers.is_empty()
    }

    /// Enable/disable precedence walk: master default, master per-tool,
    /// server default, server per-tool, global `*`, global per-tool.
    pub fn tool_enabled(&self, server: &str, tool: &str) -> bool {
        let mut enabled = true;
        if let Some(master) = &self.master {
            if let Some(flag) = master.enabled {
                enabled = flag;
            }
            if let Some(flag) = fragment_tool_enabled(master, tool) {
                enabled = flag;
            }
        }
        if let Some(fragment) = self.servers.get(server) {
            if let Some(flag) = fragment.enabled {
                enabled = flag;
            }
            if let Some(flag) = fragment_tool_enabled(fragment, tool) {
                enabled = flag;
            }
        }
        if let Some(flag) = self.tool_overrides.get("*").and_then(|c| c.enabled) {
            enabled = flag;
        }
        if let Some(flag) = self.tool_overrides.get(tool).and_then(|c| c.enabled) {
            enabled = flag;
        }
        enabled
    }

    /// Master default, then the server's own default.
    pub fn server_enabled(&self, server: &str) -> bool {
        let mut enabled = true;
        if let Some(flag) = self.master.as_ref().and_then(|m| m.enabled) {
            enabled = flag;
        }
        if let Some(flag) = self.servers.get(server).and_then(|f| f.enabled) {
            enabled = flag;
        }
        enabled
    }

    pub fn alias_for_tool(&self, tool: &str) -> Option<&str> {
        self.renamed.get(tool).map(String::as_str).filter(|a| !a.is_empty())
    }

    pub fn original_for_alias(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str).filter(|o| !o.is_empty())
    }

    /// Declared output schema for `(server, tool)`: server scope wins over
    /// the global entry.
    pub fn declared_output_schema(&self, server: &str, tool: &str) -> Option<Value> {
        if let Some(schema) = self
            .servers
            .get(server)
            .and_then(|f| f.tools.get(tool))
            .and_then(|c| c.output_schema.clone())
        {
            return Some(schema);
        }
        self.tool_overrides
            .get(tool)
            .and_then(|c| c.output_schema.clone())
    }

    fn add_warning(&mut self, msg: String) {
        push_warning(&mut self.warnings, msg);
    }
}

/// Convenience wrappers treating a missing set as "no overrides".
pub fn tool_enabled(set: Option<&ToolOverrideSet>, server: &str, tool: &str) -> bool {
    set.map(|s| s.tool_enabled(server, tool)).unwrap_or(true)
}

pub fn server_enabled(set: Option<&ToolOverrideSet>, server: &str) -> bool {
    set.map(|s| s.server_enabled(server)).unwrap_or(true)
}

/// Load the overrides file. A missing path yields `None`; a file with no
/// effective entries also yields `None`.
pub fn load_tool_overrides(path: &Path) -> anyhow::Result<Option<ToolOverrideSet>> {
    let data = std::fs::read(path)
        .with_context(|| format!("read override file {}", path.display()))?;
    let file: OverrideFile = serde_json::from_slice(&data)
        .with_context(|| format!("parse override file {}", path.display()))?;
    Ok(ToolOverrideSet::from_file(file))
}

fn fragment_tool_enabled(fragment: &OverrideFragment, tool: &str) -> Option<bool> {
    if let Some(flag) = fragment.tools.get(tool).and_then(|c| c.enabled) {
        return Some(flag);
    }
    fragment.tools.get("*").and_then(|c| c.enabled)
}

fn push_warning(warnings: &mut Vec<String>, msg: String) {
    if msg.is_empty() || warnings.iter().any(|w| *w == msg) {
        return;
    }
    warnings.push(msg);
}

/// Merge `src` entries into `dest`, field-wise, `src` winning per field.
pub fn merge_override_into(
    dest: &mut BTreeMap<String, ToolOverrideConfig>,
    src: &BTreeMap<String, ToolOverrideConfig>,
) {
    for (name, cfg) in src {
        match dest.get_mut(name) {
            Some(existing) => merge_override_config(existing, cfg),
            None => {
                dest.insert(name.clone(), cfg.clone());
            }
        }
    }
}

pub fn merge_override_config(base: &mut ToolOverrideConfig, extra: &ToolOverrideConfig) {
    if let Some(extra_ann) = &extra.annotations {
        let ann = base.annotations.get_or_insert_with(Default::default);
        if extra_ann.title.is_some() {
            ann.title = extra_ann.title.clone();
        }
        if extra_ann.read_only_hint.is_some() {
            ann.read_only_hint = extra_ann.read_only_hint;
        }
        if extra_ann.destructive_hint.is_some() {
            ann.destructive_hint = extra_ann.destructive_hint;
        }
        if extra_ann.idempotent_hint.is_some() {
            ann.idempotent_hint = extra_ann.idempotent_hint;
        }
        if extra_ann.open_world_hint.is_some() {
            ann.open_world_hint = extra_ann.open_world_hint;
        }
    }
    if extra.description.is_some() {
        base.description = extra.description.clone();
    }
    if extra.name.is_some() {
        base.name = extra.name.clone();
    }
    if extra.enabled.is_some() {
        base.enabled = extra.enabled;
    }
    if extra.input_schema.is_some() {
        base.input_schema = extra.input_schema.clone();
    }
    if extra.output_schema.is_some() {
        base.output_schema = extra.output_schema.clone();
    }
}

/// Compose two sets; `extra` wins per field, result re-sanitized.
pub fn merge_override_sets(
    base: Option<&ToolOverrideSet>,
    extra: Option<&ToolOverrideSet>,
) -> Option<ToolOverrideSet> {
    let mut result = match (base, extra) {
        (None, None) => return None,
        (None, Some(extra)) => {
            let mut clone = extra.clone();
            sanitize(&mut clone);
            return Some(clone);
        }
        (Some(base), None) => return Some(base.clone()),
        (Some(base), Some(_)) => base.clone(),
    };
    let extra = extra.expect("checked above");

    for msg in &extra.warnings {
        result.add_warning(msg.clone());
    }
    merge_override_into(&mut result.tool_overrides, &extra.tool_overrides);
    for (name, fragment) in &extra.servers {
        let dst = result.servers.entry(name.clone()).or_default();
        if fragment.enabled.is_some() {
            dst.enabled = fragment.enabled;
        }
        merge_override_into(&mut dst.tools, &fragment.tools);
    }
    if let Some(extra_master) = &extra.master {
        match &mut result.master {
            Some(master) => {
                if extra_master.enabled.is_some() {
                    master.enabled = extra_master.enabled;
                }
                merge_override_into(&mut master.tools, &extra_master.tools);
            }
            None => result.master = Some(extra_master.clone()),
        }
    }
    sanitize(&mut result);
    Some(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Master,
    Global,
    Server,
    ServerWildcard,
}

/// Trim string overrides, drop illegal renames (warning once per message),
/// and rebuild the alias tables. Iteration is key-sorted throughout, so the
/// alias-collision "first wins" rule is stable across loads.
fn sanitize(set: &mut ToolOverrideSet) {
    let mut aliases: BTreeMap<String, String> = BTreeMap::new();
    let mut renamed: BTreeMap<String, String> = BTreeMap::new();
    let mut warnings = std::mem::take(&mut set.warnings);

    fn process(
        tool_name: &str,
        cfg: &mut ToolOverrideConfig,
        scope: Scope,
        aliases: &mut BTreeMap<String, String>,
        renamed: &mut BTreeMap<String, String>,
        warnings: &mut Vec<String>,
    ) {
        if let Some(raw) = cfg.name.take() {
            let trimmed = raw.trim().to_string();
            if trimmed.is_empty() {
                // dropped
            } else if scope == Scope::Master {
                push_warning(
                    warnings,
                    format!("tool_overrides: master override cannot rename tools (entry {tool_name:?})"),
                );
            } else if tool_name != "*" {
                match aliases.get(&trimmed) {
                    Some(existing) if existing != tool_name => {
                        push_warning(
                            warnings,
                            format!(
                                "tool_overrides: alias {trimmed:?} already claimed by tool {existing:?}; ignoring for {tool_name:?}"
                            ),
                        );
                    }
                    _ => {
                        aliases.insert(trimmed.clone(), tool_name.to_string());
                        renamed.insert(tool_name.to_string(), trimmed.clone());
                        cfg.name = Some(trimmed);
                    }
                }
            }
        }

        if let Some(raw) = cfg.description.take() {
            let trimmed = raw.trim().to_string();
            if !trimmed.is_empty() {
                cfg.description = Some(trimmed);
                if scope == Scope::Master {
                    push_warning(
                        warnings,
                        format!("tool_overrides: master override applies description override for {tool_name:?}"),
                    );
                }
            }
        }

        if let Some(ann) = cfg.annotations.as_mut() {
            if let Some(raw) = ann.title.take() {
                let trimmed = raw.trim().to_string();
                if !trimmed.is_empty() {
                    ann.title = Some(trimmed);
                    if scope == Scope::Master {
                        push_warning(
                            warnings,
                            format!("tool_overrides: master override applies title override for {tool_name:?}"),
                        );
                    }
                }
            }
        }
    }

    if let Some(master) = set.master.as_mut() {
        for (name, cfg) in master.tools.iter_mut() {
            process(name, cfg, Scope::Master, &mut aliases, &mut renamed, &mut warnings);
        }
    }
    for (name, cfg) in set.tool_overrides.iter_mut() {
        let scope = if name == "*" { Scope::Master } else { Scope::Global };
        process(name, cfg, scope, &mut aliases, &mut renamed, &mut warnings);
    }
    for fragment in set.servers.values_mut() {
        for (name, cfg) in fragment.tools.iter_mut() {
            let scope = if name == "*" { Scope::ServerWildcard } else { Scope::Server };
            process(name, cfg, scope, &mut aliases, &mut renamed, &mut warnings);
        }
    }

    set.aliases = aliases;
    set.renamed = renamed;
    set.warnings = warnings;
}

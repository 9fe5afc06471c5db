use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::catalog::{build_initialize_result, tool_descriptor_from_server, ServerSnapshot};
use crate::config::McpProxyConfig;
use crate::overrides::ToolOverrideSet;
use crate::paths::Homes;
use crate::util::sha256_hex;

/// Write bytes atomically: temp sibling, then rename over the target.
/// Observers see either the full previous file or the full new one.
pub fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Marshal with 2-space indentation, append a trailing newline, write
/// atomically.
pub fn write_json_atomic(path: &Path, payload: &Value) -> anyhow::Result<()> {
    let mut data = serde_json::to_vec_pretty(payload).context("marshal snapshot")?;
    data.push(b'\n');
    write_atomic(path, &data)
}

/// Write a snapshot under one of the homes, keeping a timestamped sibling
/// history `base.<YYYYMMDD-HHMMSS>.json` pruned to `history_count` entries.
/// Rotation problems are logged, never fatal.
pub fn write_snapshot_with_history(
    homes: &Homes,
    base_path: &str,
    payload: &Value,
    history_count: usize,
    stamp: DateTime<Utc>,
) -> anyhow::Result<PathBuf> {
    let resolved = homes.mkdir_all_under(base_path)?;
    write_json_atomic(&resolved, payload)?;

    if history_count > 0 {
        let ts = stamp.format("%Y%m%d-%H%M%S");
        let base_str = resolved.to_string_lossy();
        let stamped = format!("{}.{ts}.json", base_str.trim_end_matches(".json"));
        match homes.mkdir_all_under(&stamped) {
            Ok(stamped_path) => {
                if let Err(err) = write_json_atomic(&stamped_path, payload) {
                    warn!(error = %err, path = %stamped_path.display(), "history snapshot write failed");
                }
            }
            Err(err) => warn!(error = %err, "history snapshot path rejected"),
        }
        if let Err(err) = prune_history(&resolved, history_count) {
            warn!(error = %err, "history pruning failed");
        }
    }

    Ok(resolved)
}

/// Delete the lexicographically oldest history siblings until at most `keep`
/// remain.
pub fn prune_history(base_path: &Path, keep: usize) -> anyhow::Result<()> {
    let Some(dir) = base_path.parent() else {
        return Ok(());
    };
    let base_name = base_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let prefix = format!("{}.", base_name.trim_end_matches(".json"));

    let mut history: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || !name.ends_with(".json") || name == base_name {
            continue;
        }
        history.push(entry.path());
    }

    if history.len() <= keep {
        return Ok(());
    }
    history.sort();
    for stale in history.iter().take(history.len() - keep) {
        let _ = std::fs::remove_file(stale);
    }
    Ok(())
}

/// Merged per-name descriptor list with contributing servers and a schema
/// hash, for the live descriptor snapshot.
pub fn collect_live_descriptors(servers: &BTreeMap<String, ServerSnapshot>) -> Vec<Value> {
    struct Entry {
        descriptor: Map<String, Value>,
        servers: Vec<String>,
    }

    let mut seen: BTreeMap<String, Entry> = BTreeMap::new();
    for (server_name, snapshot) in servers {
        for tool in &snapshot.tools {
            if tool.name.is_empty() {
                continue;
            }
            let descriptor = tool_descriptor_from_server(tool);
            match seen.get_mut(&tool.name) {
                Some(entry) => {
                    for (key, value) in descriptor {
                        entry.descriptor.entry(key).or_insert(value);
                    }
                    if !entry.servers.iter().any(|s| s == server_name) {
                        entry.servers.push(server_name.clone());
                    }
                }
                None => {
                    seen.insert(
                        tool.name.clone(),
                        Entry {
                            descriptor,
                            servers: vec![server_name.clone()],
                        },
                    );
                }
            }
        }
    }

    let mut out = Vec::with_capacity(seen.len());
    for (name, mut entry) in seen {
        entry.servers.sort();
        let mut record = entry.descriptor;
        record.insert("name".to_string(), Value::String(name));
        record.insert(
            "servers".to_string(),
            Value::Array(entry.servers.into_iter().map(Value::String).collect()),
        );
        let canonical = serde_json::to_vec(&record).unwrap_or_default();
        if !canonical.is_empty() {
            record.insert(
                "schemaHash".to_string(),
                Value::String(sha256_hex(&canonical)),
            );
        }
        out.push(Value::Object(record));
    }
    out
}

pub fn build_live_catalog_snapshot(
    proxy: &McpProxyConfig,
    servers: &BTreeMap<String, ServerSnapshot>,
    overrides: Option<&ToolOverrideSet>,
    generated_at: DateTime<Utc>,
) -> Value {
    let mut snapshot = build_initialize_result(proxy, servers, overrides);
    if let Value::Object(map) = &mut snapshot {
        map.insert(
            "generatedAt".to_string(),
            Value::String(generated_at.to_rfc3339()),
        );
    }
    snapshot
}

pub fn build_live_descriptor_snapshot(
    servers: &BTreeMap<String, ServerSnapshot>,
    generated_at: DateTime<Utc>,
) -> Value {
    json!({
        "generatedAt": generated_at.to_rfc3339(),
        "tools": collect_live_descriptors(servers),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;
    use stelae_mcp::{Tool, TransportKind};

    fn homes_in(dir: &Path) -> Homes {
        Homes::new(dir.join("config"), dir.join("state"))
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status.json");
        write_json_atomic(&path, &json!({ "a": 1 })).expect("first write");
        write_json_atomic(&path, &json!({ "b": 2 })).expect("second write");
        let data = std::fs::read_to_string(&path).expect("read back");
        assert!(data.ends_with('\n'));
        let parsed: Value = serde_json::from_str(&data).expect("full json");
        assert_eq!(parsed, json!({ "b": 2 }));
        assert!(!tmp_path(&path).exists(), "tmp file must not linger");
    }

    #[test]
    fn snapshot_history_is_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let homes = homes_in(dir.path());
        let base = homes
            .state
            .join("snapshots")
            .join("catalog.json")
            .to_string_lossy()
            .to_string();

        for minute in 0..4 {
            let stamp = Utc
                .with_ymd_and_hms(2024, 5, 1, 12, minute, 0)
                .single()
                .expect("stamp");
            write_snapshot_with_history(&homes, &base, &json!({ "tick": minute }), 2, stamp)
                .expect("snapshot write");
        }

        let dir_entries: Vec<String> = std::fs::read_dir(homes.state.join("snapshots"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();

        let history: Vec<&String> = dir_entries
            .iter()
            .filter(|n| n.starts_with("catalog.") && **n != "catalog.json")
            .collect();
        assert_eq!(history.len(), 2, "history pruned to 2: {dir_entries:?}");
        assert!(dir_entries.iter().any(|n| n == "catalog.json"));
        assert!(
            dir_entries.iter().any(|n| n == "catalog.20240501-120300.json"),
            "newest history entry kept: {dir_entries:?}"
        );
    }

    #[test]
    fn snapshot_outside_homes_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let homes = homes_in(dir.path());
        let outside = dir.path().join("elsewhere").join("catalog.json");
        let err = write_snapshot_with_history(
            &homes,
            &outside.to_string_lossy(),
            &json!({}),
            0,
            Utc::now(),
        );
        assert!(err.is_err());
    }

    #[test]
    fn live_descriptors_merge_servers_and_hash() {
        let mk = |server: &str| {
            let mut snap = ServerSnapshot::new(server, TransportKind::StreamableHttp);
            snap.tools = vec![Tool {
                name: "echo".to_string(),
                description: Some("Echo".to_string()),
                input_schema: Some(json!({ "type": "object" })),
                output_schema: None,
                annotations: None,
            }];
            (server.to_string(), snap)
        };
        let servers: BTreeMap<String, ServerSnapshot> = [mk("beta"), mk("alpha")].into_iter().collect();

        let descriptors = collect_live_descriptors(&servers);
        assert_eq!(descriptors.len(), 1);
        let echo = &descriptors[0];
        assert_eq!(echo["name"], "echo");
        assert_eq!(echo["servers"], json!(["alpha", "beta"]));
        let hash = echo["schemaHash"].as_str().expect("hash");
        assert_eq!(hash.len(), 64);
    }
}

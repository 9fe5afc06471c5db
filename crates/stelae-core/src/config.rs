use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stelae_mcp::TransportKind;

/// Top-level gateway configuration. Loading is a thin serde read; everything
/// interesting about these values happens in the facade and the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub mcp_proxy: McpProxyConfig,
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parse config file {}", path.display()))
    }

    /// Manifest config with proxy-derived defaults filled in.
    pub fn manifest_or_default(&self) -> ManifestConfig {
        match &self.manifest {
            Some(m) => m.clone(),
            None => ManifestConfig {
                name: self.mcp_proxy.name.clone(),
                version: self.mcp_proxy.version.clone(),
                ..ManifestConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpProxyConfig {
    /// Listen address, e.g. `127.0.0.1:9090`.
    pub addr: String,
    /// Public base URL; its path becomes the mount prefix for every route.
    pub base_url: String,
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub transport: TransportKind,
    pub url: String,
    #[serde(default)]
    pub options: ServerOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_enabled: Option<bool>,
    /// Fail startup when this downstream cannot be connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panic_if_invalid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Discovery-document settings plus the persisted-state paths the adapter
/// and snapshot writer use. All paths must resolve under one of the homes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_overrides_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_schema_status_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_catalog_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live_descriptors_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = serde_json::json!({
            "mcpProxy": {
                "addr": "127.0.0.1:9090",
                "baseUrl": "http://localhost:9090",
                "name": "stelae",
                "version": "0.4.0"
            },
            "mcpServers": {
                "fs": {
                    "transport": "streamable-http",
                    "url": "http://127.0.0.1:7001/mcp",
                    "options": { "authTokens": ["secret"], "panicIfInvalid": true }
                }
            }
        });
        let cfg: Config = serde_json::from_value(raw).expect("decode config");
        assert_eq!(cfg.mcp_proxy.name, "stelae");
        let fs = cfg.mcp_servers.get("fs").expect("fs server");
        assert_eq!(fs.transport, TransportKind::StreamableHttp);
        assert_eq!(fs.options.auth_tokens, vec!["secret".to_string()]);
        assert_eq!(fs.options.panic_if_invalid, Some(true));
        assert_eq!(cfg.manifest_or_default().name, "stelae");
    }
}

use serde_json::{json, Map, Value};

pub const FACADE_SEARCH_TOOL: &str = "search";
pub const FACADE_FETCH_TOOL: &str = "fetch";

/// A deterministic example search hit surfaced during connector
/// verification. The entries mirror real documents so a verifier can fetch
/// follow-up content without depending on upstream indexes.
struct FacadeSearchHit {
    id: &'static str,
    title: &'static str,
    text: &'static str,
    url: &'static str,
    snippet: &'static str,
}

const DEFAULT_SEARCH_HITS: &[FacadeSearchHit] = &[
    FacadeSearchHit {
        id: "repo:docs/SPEC-v1.md",
        title: "SPEC-v1.md",
        text: "Summary of the Stelae MCP compliance requirements and verification flow.",
        url: "stelae://repo/docs/SPEC-v1.md",
        snippet: "SPEC outlines the MCP handshake contract, tool catalog expectations, and SSE timing guarantees.",
    },
    FacadeSearchHit {
        id: "repo:dev/chat_gpt_connector_compliant_reference.md",
        title: "chat_gpt_connector_compliant_reference.md",
        text: "Reference catalog consolidating manifest, initialize, and search requirements for ChatGPT connectors.",
        url: "stelae://repo/dev/chat_gpt_connector_compliant_reference.md",
        snippet: "Reference doc captures the minimal search/fetch tool set plus example payloads used by compliant servers.",
    },
    FacadeSearchHit {
        id: "repo:dev/compliance_handoff.md",
        title: "compliance_handoff.md",
        text: "Action plan enumerating the remediation steps to align the Stelae MCP endpoint with ChatGPT verification.",
        url: "stelae://repo/dev/compliance_handoff.md",
        snippet: "Handoff describes trimming initialize/tools.list outputs and delivering deterministic search hits for validation.",
    },
];

fn hit_payload(hit: &FacadeSearchHit) -> Value {
    json!({
        "id": hit.id,
        "title": hit.title,
        "text": hit.text,
        "url": hit.url,
        "metadata": { "snippet": hit.snippet },
    })
}

/// The static result set served for `search`. The query is accepted but does
/// not influence the hits; verifiers need determinism, not relevance.
pub fn build_facade_search_payload(_query: &str) -> Value {
    let results: Vec<Value> = DEFAULT_SEARCH_HITS.iter().map(hit_payload).collect();
    json!({ "results": results })
}

/// Look a fetch id up against the static hit set.
pub fn build_facade_fetch_payload(id: &str) -> Option<Value> {
    DEFAULT_SEARCH_HITS
        .iter()
        .find(|hit| hit.id == id)
        .map(hit_payload)
}

/// Default descriptor for the injected `search` tool.
pub fn search_tool_descriptor() -> Map<String, Value> {
    let value = json!({
        "name": FACADE_SEARCH_TOOL,
        "description": "Lightweight search placeholder exposed for ChatGPT connector verification.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "query": { "title": "Query", "type": "string" }
            },
            "required": ["query"]
        }
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!("descriptor literal is an object"),
    }
}

/// Default descriptor for the injected `fetch` tool. Upstream connector docs
/// describe fetch by `url`; the facade serves ids, so the schema is keyed by
/// `id` (see `ensure_fetch_id_schema`).
pub fn fetch_tool_descriptor() -> Map<String, Value> {
    let value = json!({
        "name": FACADE_FETCH_TOOL,
        "description": "Connector-compliant fetch placeholder used when no upstream descriptor is available.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "url": { "title": "Url", "type": "string" }
            },
            "required": ["url"]
        }
    });
    match value {
        Value::Object(map) => map,
        _ => unreachable!("descriptor literal is an object"),
    }
}

use serde_json::{Map, Value};

use stelae_mcp::ToolAnnotations;

/// Materialize the annotation record for a tool descriptor: the four boolean
/// hints are always present (`false` when the downstream omitted them) and
/// `title` is carried only when non-empty.
pub fn normalize_tool_annotations(annotations: Option<&ToolAnnotations>) -> Map<String, Value> {
    let mut out = Map::with_capacity(5);
    let existing = annotations.cloned().unwrap_or_default();

    if let Some(title) = existing.title.filter(|t| !t.is_empty()) {
        out.insert("title".to_string(), Value::String(title));
    }
    out.insert(
        "readOnlyHint".to_string(),
        Value::Bool(existing.read_only_hint.unwrap_or(false)),
    );
    out.insert(
        "destructiveHint".to_string(),
        Value::Bool(existing.destructive_hint.unwrap_or(false)),
    );
    out.insert(
        "idempotentHint".to_string(),
        Value::Bool(existing.idempotent_hint.unwrap_or(false)),
    );
    out.insert(
        "openWorldHint".to_string(),
        Value::Bool(existing.open_world_hint.unwrap_or(false)),
    );

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_all_hints_false() {
        let ann = normalize_tool_annotations(None);
        for key in ["readOnlyHint", "destructiveHint", "idempotentHint", "openWorldHint"] {
            assert_eq!(ann.get(key), Some(&Value::Bool(false)), "hint {key}");
        }
        assert!(ann.get("title").is_none());
    }

    #[test]
    fn preserves_existing_hints_and_title() {
        let src = ToolAnnotations {
            title: Some("My Tool".to_string()),
            read_only_hint: Some(true),
            destructive_hint: Some(false),
            ..Default::default()
        };
        let ann = normalize_tool_annotations(Some(&src));
        assert_eq!(ann.get("title"), Some(&Value::String("My Tool".to_string())));
        assert_eq!(ann.get("readOnlyHint"), Some(&Value::Bool(true)));
        assert_eq!(ann.get("destructiveHint"), Some(&Value::Bool(false)));
        assert_eq!(ann.get("idempotentHint"), Some(&Value::Bool(false)));
    }
}

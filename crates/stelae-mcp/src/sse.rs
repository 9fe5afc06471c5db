use anyhow::Context as _;

/// Minimal SSE decoder for streamable-HTTP response bodies.
///
/// Only `data:` fields matter here; each blank-line-delimited event becomes
/// one joined payload string. Comments and other fields are skipped.
pub fn decode_sse_events(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut pending: Vec<&str> = Vec::new();

    let mut flush = |pending: &mut Vec<&str>, events: &mut Vec<String>| {
        if !pending.is_empty() {
            events.push(pending.join("\n"));
            pending.clear();
        }
    };

    for raw in body.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            flush(&mut pending, &mut events);
        } else if let Some(rest) = line.strip_prefix("data:") {
            pending.push(rest.trim_start());
        }
        // `event:`/`id:` fields and `:` comments carry no payload
    }
    flush(&mut pending, &mut events);

    events
}

/// Parse the first SSE event's data as a JSON value.
pub fn first_json_message(body: &str) -> anyhow::Result<serde_json::Value> {
    let events = decode_sse_events(body);
    let first = events.first().context("sse body carried no events")?;
    serde_json::from_str(first).context("parse sse event data as json")
}

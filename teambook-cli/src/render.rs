//! Pipe-mode rendering for kernel responses.
//!
//! Lists become one pipe-delimited line per record; scalars render as
//! `key:value` pairs on one line; errors are `!code|detail`.

use serde_json::Value as JsonValue;
use teambook_kernel::KernelResponse;

pub fn pipe(response: &KernelResponse) -> String {
    if !response.success {
        return response.to_pipe();
    }
    let Some(data) = &response.data else {
        return response.message.clone();
    };

    // Render the first array field as rows, if any.
    if let Some((_, rows)) = data
        .as_object()
        .and_then(|map| map.iter().find(|(_, v)| v.is_array()))
    {
        let rows = rows.as_array().expect("checked above");
        if rows.is_empty() {
            return response.message.clone();
        }
        return rows.iter().map(row_line).collect::<Vec<_>>().join("\n");
    }

    scalar_line(data)
}

fn row_line(row: &JsonValue) -> String {
    match row.as_object() {
        Some(map) => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| format!("{}:{}", key, flat(value)))
            .collect::<Vec<_>>()
            .join("|"),
        None => flat(row),
    }
}

fn scalar_line(data: &JsonValue) -> String {
    match data.as_object() {
        Some(map) if !map.is_empty() => map
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| format!("{}:{}", key, flat(value)))
            .collect::<Vec<_>>()
            .join("|"),
        _ => flat(data),
    }
}

fn flat(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => pipe_escape(s),
        other => pipe_escape(&other.to_string()),
    }
}

/// Pipe-mode fields must not contain the delimiter or newlines.
fn pipe_escape(raw: &str) -> String {
    raw.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use teambook_core::{ErrorCode, TeambookError};

    #[test]
    fn test_scalar_rendering() {
        let response = KernelResponse::ok("note 1", json!({"note_id": 1, "session_id": 2}));
        assert_eq!(pipe(&response), "note_id:1|session_id:2");
    }

    #[test]
    fn test_row_rendering() {
        let response = KernelResponse::ok(
            "2 notes",
            json!({"notes": [
                {"id": 1, "content": "a"},
                {"id": 2, "content": "b|c"},
            ]}),
        );
        let rendered = pipe(&response);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("id:1"));
        assert!(lines[1].contains("b\\|c"));
    }

    #[test]
    fn test_error_rendering() {
        let response =
            KernelResponse::err(TeambookError::new(ErrorCode::NotYourLock, "locked_by:alpha-001"));
        assert_eq!(pipe(&response), "!not_your_lock|locked_by:alpha-001");
    }

    #[test]
    fn test_empty_list_uses_message() {
        let response = KernelResponse::ok("0 events", json!({"events": []}));
        assert_eq!(pipe(&response), "0 events");
    }
}

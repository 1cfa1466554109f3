use serde::Serialize;
use serde_json::{Map, Value};

/// Keys that mark a whole JSON object as an importable payload.
pub const PAYLOAD_MARKER_KEYS: [&str; 3] = ["documents", "document", "compendiums"];

/// Canonical result returned to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub content: String,
    pub payload: Option<Value>,
    pub usage: Option<Value>,
}

impl ResponseEnvelope {
    pub fn with_usage(mut self, usage: Option<Value>) -> Self {
        self.usage = usage;
        self
    }
}

/// Normalize raw provider or command output.
///
/// Never fails: anything that is not a JSON object is passed through as
/// trimmed text with no payload.
pub fn parse_output(raw: &str) -> ResponseEnvelope {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ResponseEnvelope::default();
    }

    let passthrough = || ResponseEnvelope {
        content: trimmed.to_string(),
        ..Default::default()
    };

    let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(trimmed) else {
        return passthrough();
    };

    if has_payload_marker(&obj) {
        return ResponseEnvelope {
            content: trimmed.to_string(),
            payload: Some(Value::Object(obj)),
            usage: None,
        };
    }

    if let Some(Value::String(content)) = obj.get("content") {
        let payload = obj.get("payload").filter(|p| !p.is_null()).cloned();
        return ResponseEnvelope {
            content: content.clone(),
            payload,
            usage: None,
        };
    }

    passthrough()
}

fn has_payload_marker(obj: &Map<String, Value>) -> bool {
    PAYLOAD_MARKER_KEYS
        .iter()
        .any(|key| obj.get(*key).is_some_and(|v| !v.is_null()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_documents_object_becomes_payload() {
        let raw = "  {\"documents\":[{\"type\":\"JournalEntry\"}]}\n";
        let out = parse_output(raw);
        assert_eq!(out.content, raw.trim());
        assert_eq!(
            out.payload,
            Some(json!({"documents": [{"type": "JournalEntry"}]}))
        );
    }

    #[test]
    fn test_single_document_and_compendiums_are_markers() {
        let out = parse_output(r#"{"document":{"type":"Item"},"content":"ignored"}"#);
        assert_eq!(out.content, r#"{"document":{"type":"Item"},"content":"ignored"}"#);
        assert!(out.payload.is_some());

        let out = parse_output(r#"{"compendiums":[{"name":"npcs"}]}"#);
        assert_eq!(out.payload, Some(json!({"compendiums": [{"name": "npcs"}]})));
    }

    #[test]
    fn test_plain_text_passthrough() {
        let out = parse_output("plain text");
        assert_eq!(out.content, "plain text");
        assert_eq!(out.payload, None);
    }

    #[test]
    fn test_content_and_payload_fields() {
        let out = parse_output(r#"{"content":"hi","payload":{"a":1}}"#);
        assert_eq!(out.content, "hi");
        assert_eq!(out.payload, Some(json!({"a": 1})));

        let out = parse_output(r#"{"content":"hi","payload":null}"#);
        assert_eq!(out.content, "hi");
        assert_eq!(out.payload, None);
    }

    #[test]
    fn test_object_without_known_fields_falls_through() {
        let raw = r#"{"payload":{"a":1},"other":true}"#;
        let out = parse_output(raw);
        assert_eq!(out.content, raw);
        assert_eq!(out.payload, None);

        let out = parse_output(r#"{"content": 5}"#);
        assert_eq!(out.content, r#"{"content": 5}"#);
        assert_eq!(out.payload, None);
    }

    #[test]
    fn test_non_object_json_and_empty() {
        assert_eq!(parse_output("[1,2,3]").content, "[1,2,3]");
        assert_eq!(parse_output("[1,2,3]").payload, None);
        assert_eq!(parse_output("   \n"), ResponseEnvelope::default());
        assert_eq!(parse_output("{\"documents\": [").content, "{\"documents\": [");
    }

    #[test]
    fn test_parse_is_repeatable() {
        for raw in [
            r#"{"documents":[]}"#,
            "plain",
            r#"{"content":"x","payload":[1]}"#,
            "",
        ] {
            assert_eq!(parse_output(raw), parse_output(raw));
        }
    }
}

use serde_json::Value;

/**
 * Extracts routing identifiers from a parsed envelope without fully decoding
 * the payload. Format-specific and exchange-specific; the core only requires
 * that it be deterministic.
 *
 * An empty result is not the same as unparseable: it means the frame parsed
 * fine but claims no stream identifier (it will be routed to `UnhandledMessage`
 * if no pending query claims it either).
 */
pub trait MessageIdentifier: Send + Sync {
    fn identify(&self, value: &Value) -> Vec<String>;
}

/**
 * Recognizes two common envelope shapes: the combined
 * `{"stream": ..., "data": ...}` format, and direct events carrying an
 * `"e"` event-type field. Adequate for a generic default; any exchange
 * with a different envelope supplies its own [`MessageIdentifier`].
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMessageIdentifier;

impl MessageIdentifier for DefaultMessageIdentifier {
    fn identify(&self, value: &Value) -> Vec<String> {
        if let Some(stream) = value.get("stream").and_then(Value::as_str) {
            return vec![stream.to_string()];
        }

        if let Some(event_type) = value.get("e").and_then(Value::as_str) {
            return vec![event_type.to_string()];
        }

        if let Some(nested) = value.get("event").and_then(|e| e.get("e")).and_then(Value::as_str) {
            return vec![nested.to_string()];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifies_combined_stream_format() {
        let identifier = DefaultMessageIdentifier;
        let msg = json!({ "stream": "btcusdt@trade", "data": {} });
        assert_eq!(identifier.identify(&msg), vec!["btcusdt@trade"]);
    }

    #[test]
    fn identifies_direct_event_format() {
        let identifier = DefaultMessageIdentifier;
        let msg = json!({ "e": "trade", "s": "BTCUSDT" });
        assert_eq!(identifier.identify(&msg), vec!["trade"]);
    }

    #[test]
    fn returns_empty_for_unrecognized_envelope() {
        let identifier = DefaultMessageIdentifier;
        let msg = json!({ "id": "1", "result": null });
        assert!(identifier.identify(&msg).is_empty());
    }
}

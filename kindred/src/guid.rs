//! Opaque cross-model identifiers: `base64("Model#id")`.

use crate::error::{KindredError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;

pub fn encode(model: &str, id: &Value) -> String {
    let id = match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    URL_SAFE_NO_PAD.encode(format!("{model}#{id}"))
}

/// Split a guid into its model name and raw id string.
pub fn decode(guid: &str) -> Result<(String, String)> {
    let bytes = URL_SAFE_NO_PAD.decode(guid.trim())?;
    let text = String::from_utf8(bytes)
        .map_err(|_| KindredError::Query(format!("guid '{guid}' is not valid UTF-8")))?;
    match text.split_once('#') {
        Some((model, id)) if !model.is_empty() && !id.is_empty() => {
            Ok((model.to_string(), id.to_string()))
        }
        _ => Err(KindredError::Query(format!("guid '{guid}' is malformed"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_and_string_ids() {
        let guid = encode("Book", &json!(12));
        assert_eq!(decode(&guid).unwrap(), ("Book".to_string(), "12".to_string()));
        let guid = encode("Person", &json!("01HZ#x"));
        assert_eq!(decode(&guid).unwrap(), ("Person".to_string(), "01HZ#x".to_string()));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode("!!!").is_err());
        assert!(decode(&URL_SAFE_NO_PAD.encode("no-separator")).is_err());
    }
}

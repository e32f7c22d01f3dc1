use serde::Deserialize;
use serde_json::json;

use chorus_core::{Error, ProviderConfig, ProviderRequest};

/// Build a streaming `streamGenerateContent` request.
///
/// The API key travels in the query string; the prompt is sent as a single
/// user content entry with the system context as `systemInstruction`.
pub fn build_request(
    config: &ProviderConfig,
    prompt: &str,
    system_context: Option<&str>,
) -> ProviderRequest {
    let url = format!(
        "{}/models/{}:streamGenerateContent?alt=sse&key={}",
        config.endpoint_url.trim_end_matches('/'),
        config.model,
        config.api_key
    );

    let mut body = json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": prompt }],
        }],
    });
    if let Some(context) = system_context.filter(|c| !c.is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": context }] });
    }

    ProviderRequest {
        url,
        headers: vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "text/event-stream".to_string()),
        ],
        body,
    }
}

/// Text of `candidates[0].content.parts[0].text` in one frame payload.
///
/// A frame carrying an `error` object fails with a protocol error.
pub fn extract_chunk(payload: &str) -> Result<Option<String>, Error> {
    let frame: GeminiStreamFrame = serde_json::from_str(payload)?;
    if let Some(error) = frame.error {
        return Err(Error::protocol(error_message(&error)));
    }

    Ok(frame
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text))
}

pub(crate) fn error_message(error: &serde_json::Value) -> String {
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| error.as_str().map(str::to_string))
        .unwrap_or_else(|| error.to_string())
}

// ── Stream frame types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GeminiStreamFrame {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::WireProtocol;

    fn config() -> ProviderConfig {
        ProviderConfig::new("gemini", "gemini-2.5-flash", "test-key", WireProtocol::Gemini)
    }

    #[test]
    fn test_build_request_uses_query_string_key() {
        let request = build_request(&config(), "Hello", None);

        assert_eq!(
            request.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse&key=test-key"
        );
        assert!(request.header("Authorization").is_none());
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    #[test]
    fn test_build_request_body() {
        let request = build_request(&config(), "Hello", None);

        assert_eq!(request.body["contents"][0]["role"], "user");
        assert_eq!(request.body["contents"][0]["parts"][0]["text"], "Hello");
        assert!(request.body.get("systemInstruction").is_none());
    }

    #[test]
    fn test_build_request_system_instruction() {
        let request = build_request(&config(), "Hello", Some("Be brief."));
        assert_eq!(
            request.body["systemInstruction"]["parts"][0]["text"],
            "Be brief."
        );
        // System context does not appear in contents
        assert_eq!(request.body["contents"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_build_request_custom_endpoint() {
        let config = config().with_endpoint_url("https://proxy.example.com/v1beta/");
        let request = build_request(&config, "Hi", None);
        assert!(request
            .url
            .starts_with("https://proxy.example.com/v1beta/models/gemini-2.5-flash:"));
    }

    #[test]
    fn test_extract_first_text_part() {
        let payload = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"ignored"}],"role":"model"}}]}"#;
        assert_eq!(extract_chunk(payload).unwrap(), Some("Hel".to_string()));
    }

    #[test]
    fn test_extract_missing_path_is_not_an_error() {
        let payload = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":3}}"#;
        assert_eq!(extract_chunk(payload).unwrap(), None);
        assert_eq!(extract_chunk("{}").unwrap(), None);
    }

    #[test]
    fn test_extract_error_object() {
        let payload = r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = extract_chunk(payload).unwrap_err();
        assert!(matches!(err, Error::Protocol(ref m) if m == "Quota exceeded"));
    }

    #[test]
    fn test_extract_malformed_json() {
        let err = extract_chunk("{\"candidates\":").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}

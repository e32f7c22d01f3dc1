use serde::Deserialize;
use serde_json::json;

use chorus_core::{Error, ProviderConfig, ProviderRequest};

use crate::gemini::error_message;

/// Build a streaming chat-completions request with bearer authentication.
pub fn build_request(
    config: &ProviderConfig,
    prompt: &str,
    system_context: Option<&str>,
) -> ProviderRequest {
    let url = format!(
        "{}/chat/completions",
        config.endpoint_url.trim_end_matches('/')
    );

    let mut messages = Vec::new();
    if let Some(context) = system_context.filter(|c| !c.is_empty()) {
        messages.push(json!({ "role": "system", "content": context }));
    }
    messages.push(json!({ "role": "user", "content": prompt }));

    ProviderRequest {
        url,
        headers: vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", config.api_key),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "text/event-stream".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
        ],
        body: json!({
            "model": config.model,
            "messages": messages,
            "stream": true,
        }),
    }
}

/// Text of `choices[0].delta.content` in one frame payload.
///
/// A frame carrying an `error` object fails with a protocol error.
pub fn extract_chunk(payload: &str) -> Result<Option<String>, Error> {
    let frame: OpenAIStreamFrame = serde_json::from_str(payload)?;
    if let Some(error) = frame.error {
        return Err(Error::protocol(error_message(&error)));
    }

    Ok(frame
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content))
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFrame {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: Option<OpenAIDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

use serde::Serialize;

use super::registry::BackendTarget;

pub const STRUCTURED_TEMPERATURE: f64 = 0.3;
pub const STRUCTURED_MAX_TOKENS: u32 = 2000;

const HOSTED_COMPLETIONS_PATH: &str = "chat/completions";

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub url: String,
    pub bearer: Option<String>,
    pub body: ChatCompletionBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{path}")
    }
}

pub fn build(
    target: &BackendTarget,
    prompt: &str,
    temperature: f64,
    streaming: bool,
) -> UpstreamRequest {
    let (url, secret) = match target {
        BackendTarget::Hosted {
            base_url, api_key, ..
        } => (join_url(base_url, HOSTED_COMPLETIONS_PATH), api_key),
        BackendTarget::Custom {
            base_url,
            path,
            secret,
            ..
        } => (join_url(base_url, path), secret),
    };

    UpstreamRequest {
        url,
        bearer: Some(secret.trim())
            .filter(|secret| !secret.is_empty())
            .map(ToOwned::to_owned),
        body: ChatCompletionBody {
            model: target.model_name().to_owned(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_owned(),
            }],
            temperature,
            stream: streaming,
            max_tokens: None,
        },
    }
}

/// Non-streaming request for JSON extraction. Temperature and the token cap
/// are fixed regardless of what the caller asked for.
pub fn build_structured(target: &BackendTarget, prompt: &str) -> UpstreamRequest {
    let mut request = build(target, prompt, STRUCTURED_TEMPERATURE, false);
    request.body.max_tokens = Some(STRUCTURED_MAX_TOKENS);
    request
}

pub mod http;
pub mod mock;
pub mod registry;
pub mod request;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use request::UpstreamRequest;

pub type UpstreamStream = BoxStream<'static, Result<Vec<u8>, BackendError>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn open_stream(&self, request: UpstreamRequest) -> Result<UpstreamStream, BackendError>;

    async fn complete(&self, request: UpstreamRequest) -> Result<String, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("upstream returned status {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("upstream connection failed: {0}")]
    Transport(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("upstream payload malformed: {0}")]
    MalformedPayload(String),
}

impl BackendError {
    pub fn from_status(status: u16, body: &str) -> Self {
        Self::Http {
            status,
            detail: upstream_error_detail(body),
        }
    }
}

pub fn upstream_error_detail(body: &str) -> String {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(|message| message.as_str())
                .map(ToOwned::to_owned)
        });

    match message {
        Some(message) => message,
        None => {
            let trimmed = body.trim();
            let truncated = trimmed.chars().take(200).collect::<String>();
            if truncated.len() < trimmed.len() {
                format!("{truncated}...")
            } else {
                truncated
            }
        }
    }
}

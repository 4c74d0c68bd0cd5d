use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::backend::{request::UpstreamRequest, BackendError, ChatTransport, UpstreamStream};

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    completion_timeout: Duration,
}

impl HttpTransport {
    // Connect timeout only; non-streaming calls set their own per request.
    pub fn new(connect_timeout: Duration, completion_timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| format!("failed to build upstream HTTP client: {error}"))?;

        Ok(Self {
            client,
            completion_timeout,
        })
    }

    fn post(&self, request: &UpstreamRequest) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(&request.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.body);
        match &request.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn open_stream(&self, request: UpstreamRequest) -> Result<UpstreamStream, BackendError> {
        let response = self
            .post(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        debug!(url = %request.url, status = status.as_u16(), "upstream stream opened");
        Ok(response
            .bytes_stream()
            .map(|next| {
                next.map(|bytes| bytes.to_vec())
                    .map_err(map_transport_error)
            })
            .boxed())
    }

    async fn complete(&self, request: UpstreamRequest) -> Result<String, BackendError> {
        let response = self
            .post(&request)
            .timeout(self.completion_timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "upstream completion received");
        Ok(body)
    }
}

fn map_transport_error(error: reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else {
        BackendError::Transport(error.to_string())
    }
}

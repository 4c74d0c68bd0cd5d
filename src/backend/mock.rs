use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{request::UpstreamRequest, BackendError, ChatTransport, UpstreamStream};

#[derive(Debug, Clone)]
pub enum StreamScript {
    Body { chunks: Vec<String>, hold_open: bool },
    Status { status: u16, body: String },
    /// Yields the chunks, then fails the connection.
    Disconnect { chunks: Vec<String>, message: String },
    /// Accepts the request but never sends response headers.
    Unresponsive,
}

#[derive(Debug, Clone)]
pub enum CompletionScript {
    Body(String),
    Status { status: u16, body: String },
    Timeout,
}

pub struct ScriptedTransport {
    stream: StreamScript,
    completion: CompletionScript,
    requests: Mutex<Vec<UpstreamRequest>>,
    released: Arc<AtomicBool>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new(
            StreamScript::Body {
                chunks: vec!["data: [DONE]\n".to_owned()],
                hold_open: false,
            },
            CompletionScript::Body(completion_body(r#"{"nodes":[],"links":[]}"#)),
        )
    }
}

impl ScriptedTransport {
    pub fn new(stream: StreamScript, completion: CompletionScript) -> Self {
        Self {
            stream,
            completion,
            requests: Mutex::new(Vec::new()),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sse_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let chunks = lines
            .into_iter()
            .map(|line| format!("{}\n", line.into()))
            .collect();
        Self::new(
            StreamScript::Body {
                chunks,
                hold_open: false,
            },
            CompletionScript::Status {
                status: 500,
                body: "streaming only".to_owned(),
            },
        )
    }

    pub fn replying(content: &str) -> Self {
        Self::new(
            StreamScript::Status {
                status: 500,
                body: "completion only".to_owned(),
            },
            CompletionScript::Body(completion_body(content)),
        )
    }

    pub async fn requests(&self) -> Vec<UpstreamRequest> {
        self.requests.lock().await.clone()
    }

    pub fn upstream_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

pub fn completion_body(content: &str) -> String {
    json!({
        "id": "cmpl-scripted",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
    .to_string()
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(&self, request: UpstreamRequest) -> Result<UpstreamStream, BackendError> {
        self.requests.lock().await.push(request);

        let (chunks, hold_open, failure) = match &self.stream {
            StreamScript::Status { status, body } => {
                return Err(BackendError::from_status(*status, body));
            }
            StreamScript::Body { chunks, hold_open } => (chunks.clone(), *hold_open, None),
            StreamScript::Disconnect { chunks, message } => {
                (chunks.clone(), false, Some(message.clone()))
            }
            StreamScript::Unresponsive => {
                futures_util::future::pending::<()>().await;
                (Vec::new(), false, None)
            }
        };

        let guard = ReleaseGuard(self.released.clone());
        let stream = async_stream::stream! {
            let _guard = guard;
            for chunk in chunks {
                yield Ok(chunk.into_bytes());
            }
            if let Some(message) = failure {
                yield Err(BackendError::Transport(message));
                return;
            }
            if hold_open {
                futures_util::future::pending::<()>().await;
            }
        };

        debug!(transport = self.name(), "scripted stream prepared");
        Ok(stream.boxed())
    }

    async fn complete(&self, request: UpstreamRequest) -> Result<String, BackendError> {
        self.requests.lock().await.push(request);
        match &self.completion {
            CompletionScript::Body(body) => Ok(body.clone()),
            CompletionScript::Status { status, body } => {
                Err(BackendError::from_status(*status, body))
            }
            CompletionScript::Timeout => Err(BackendError::Timeout(
                "scripted completion timed out".to_owned(),
            )),
        }
    }
}

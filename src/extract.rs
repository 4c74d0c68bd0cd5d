use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    backend::{registry::ResolveError, request, BackendError, ChatTransport},
    models::GraphResult,
    store::ConfigStore,
};

pub const NODE_CATEGORIES: [&str; 6] = ["人物", "地点", "物品", "概念", "事件", "规则"];

pub const LINK_TYPES: [&str; 5] = ["包含", "属于", "导致", "影响", "引用"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Relationship,
    Knowledge,
}

impl GraphKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Relationship => "relationship_graph",
            Self::Knowledge => "knowledge_graph",
        }
    }

    pub fn prompt(self, content: &str) -> String {
        match self {
            Self::Relationship => format!(
                "分析文本中的人物关系，输出JSON格式：\n\
                 {{\"nodes\":[{{\"id\":\"人物名\",\"name\":\"人物名\"}}],\
                 \"links\":[{{\"source\":\"人物1\",\"target\":\"人物2\",\"relation\":\"关系\"}}]}}\n\
                 要求：\n\
                 1. nodes包含所有人物，只需id和name字段\n\
                 2. links包含所有关系，必须有relation字段\n\
                 3. relation必须是简短中文词语\n\
                 4. 只输出JSON，不要其他内容\n\
                 文本：{content}"
            ),
            Self::Knowledge => format!(
                "分析文本中的知识点和关系，输出JSON格式：\n\
                 {{\"nodes\":[{{\"id\":\"知识点ID\",\"name\":\"知识点名称\",\"category\":\"分类\",\"tags\":[\"标签\"]}}],\
                 \"links\":[{{\"source\":\"知识点1\",\"target\":\"知识点2\",\"relation\":\"关系\",\"type\":\"关系类型\"}}]}}\n\
                 要求：\n\
                 1. nodes包含所有知识点，必须有id、name、category和tags字段\n\
                 2. category必须是以下之一：{categories}\n\
                 3. tags是相关标签数组，至少包含一个标签\n\
                 4. links包含所有关系，必须有source、target、relation和type字段\n\
                 5. type必须是以下之一：{link_types}\n\
                 6. relation必须是简短中文词语\n\
                 7. 只输出JSON，不要其他内容\n\
                 文本：{content}",
                categories = NODE_CATEGORIES.join("、"),
                link_types = LINK_TYPES.join("、"),
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no content provided")]
    MissingContent,
    #[error("no model selected")]
    MissingModel,
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("upstream API error: {0}")]
    Upstream(BackendError),
    #[error("upstream API did not answer in time: {0}")]
    UpstreamTimeout(String),
    #[error("upstream response is malformed: {0}")]
    MalformedResponse(String),
    #[error("the model reply is incomplete; try shortening the text or switching to another model")]
    IncompleteResponse,
    #[error("the model reply is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("the model reply has the wrong shape: {0}")]
    InvalidShape(String),
}

impl From<BackendError> for ExtractError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Timeout(message) => Self::UpstreamTimeout(message),
            other => Self::Upstream(other),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

pub async fn extract(
    transport: &dyn ChatTransport,
    store: &ConfigStore,
    content: &str,
    model: &str,
    kind: GraphKind,
) -> Result<GraphResult, ExtractError> {
    if content.trim().is_empty() {
        return Err(ExtractError::MissingContent);
    }
    if model.trim().is_empty() {
        return Err(ExtractError::MissingModel);
    }

    let target = store.resolve(model).await?;
    let upstream = request::build_structured(&target, &kind.prompt(content));
    info!(
        kind = kind.label(),
        backend = target.label(),
        model = %target.model_name(),
        url = %upstream.url,
        "graph extraction requested"
    );

    let body = transport.complete(upstream).await?;
    let reply = completion_content(&body)?;
    let graph = parse_graph_reply(&reply).inspect_err(|error| {
        warn!(kind = kind.label(), error = %error, reply = %preview(&reply), "graph reply rejected");
    })?;

    info!(
        kind = kind.label(),
        nodes = graph.nodes.len(),
        links = graph.links.len(),
        "graph extraction succeeded"
    );
    Ok(graph)
}

pub fn completion_content(body: &str) -> Result<String, ExtractError> {
    let parsed: CompletionResponse = serde_json::from_str(body)
        .map_err(|error| ExtractError::MalformedResponse(error.to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| ExtractError::MalformedResponse("missing message content".to_owned()))
}

pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if trimmed.len() < 6 || !trimmed.starts_with("```") || !trimmed.ends_with("```") {
        return trimmed;
    }

    let inner = &trimmed[3..trimmed.len() - 3];
    let inner = ["json", "text"]
        .iter()
        .find_map(|tag| {
            inner
                .get(..tag.len())
                .filter(|head| head.eq_ignore_ascii_case(tag))
                .map(|_| &inner[tag.len()..])
        })
        .unwrap_or(inner);
    inner.trim()
}

pub fn parse_graph_reply(reply: &str) -> Result<GraphResult, ExtractError> {
    let text = strip_code_fence(reply);
    if !text.ends_with('}') {
        return Err(ExtractError::IncompleteResponse);
    }

    let value: Value =
        serde_json::from_str(text).map_err(|error| ExtractError::InvalidJson(error.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ExtractError::InvalidShape(
            "reply is not a JSON object".to_owned(),
        ));
    };

    let nodes = take_list(&mut object, "nodes")?;
    let links = take_list(&mut object, "links")?;
    Ok(GraphResult {
        nodes,
        links,
        extra: object,
    })
}

fn take_list(
    object: &mut serde_json::Map<String, Value>,
    field: &str,
) -> Result<Vec<Value>, ExtractError> {
    match object.remove(field) {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(ExtractError::InvalidShape(format!(
            "`{field}` is not a list"
        ))),
        None => Err(ExtractError::InvalidShape(format!(
            "missing `{field}` field"
        ))),
    }
}

fn preview(text: &str) -> String {
    text.chars().take(200).collect()
}

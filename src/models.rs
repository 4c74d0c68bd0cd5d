use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
}

impl GenerateBody {
    pub fn into_request(self) -> Result<GenerationRequest, String> {
        let (Some(model), Some(prompt)) = (self.model, self.prompt) else {
            return Err("missing required fields: model and prompt".to_owned());
        };
        if model.trim().is_empty() {
            return Err("model is required".to_owned());
        }

        Ok(GenerationRequest {
            model,
            prompt,
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphBody {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEvent {
    Token(String),
    Reasoning(String),
    Error(String),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Reasoning(_) => "reasoning",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphResult {
    pub nodes: Vec<Value>,
    pub links: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomApiConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub secret: String,
    pub model_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomApiInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
}

impl CustomApiInput {
    pub fn into_config(self, id: String) -> Result<CustomApiConfig, String> {
        let (Some(name), Some(base_url), Some(model_name)) =
            (self.name, self.base_url, self.model_name)
        else {
            return Err("missing required fields: name, baseUrl and modelName".to_owned());
        };

        Ok(CustomApiConfig {
            id,
            name,
            base_url,
            path: self.path.unwrap_or_default(),
            secret: self.secret.unwrap_or_default(),
            model_name,
        })
    }

    pub fn apply_to(self, config: &mut CustomApiConfig) {
        if let Some(name) = self.name {
            config.name = name;
        }
        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        if let Some(path) = self.path {
            config.path = path;
        }
        if let Some(secret) = self.secret {
            config.secret = secret;
        }
        if let Some(model_name) = self.model_name {
            config.model_name = model_name;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetApiKeyBody {
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyStatus {
    pub has_key: bool,
    pub key_preview: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

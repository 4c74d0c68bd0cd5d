use indexmap::IndexMap;
use thiserror::Error;

use crate::models::CustomApiConfig;

pub const CUSTOM_MODEL_PREFIX: &str = "custom-";

pub type CustomApis = IndexMap<String, CustomApiConfig>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    Hosted {
        base_url: String,
        api_key: String,
        model: String,
    },
    Custom {
        id: String,
        base_url: String,
        path: String,
        secret: String,
        model_name: String,
    },
}

impl BackendTarget {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Hosted { .. } => "hosted",
            Self::Custom { .. } => "custom",
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            Self::Hosted { model, .. } => model,
            Self::Custom { model_name, .. } => model_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("custom API configuration not found: {0}")]
    ConfigNotFound(String),
    #[error("no hosted API key configured; set one via /api/set-api-key before generating")]
    Unauthorized,
}

pub fn resolve(
    model_id: &str,
    configs: &CustomApis,
    hosted_key: Option<&str>,
    hosted_base: &str,
) -> Result<BackendTarget, ResolveError> {
    if let Some(config_id) = model_id.strip_prefix(CUSTOM_MODEL_PREFIX) {
        let config = configs
            .get(config_id)
            .ok_or_else(|| ResolveError::ConfigNotFound(config_id.to_owned()))?;
        return Ok(BackendTarget::Custom {
            id: config.id.clone(),
            base_url: config.base_url.clone(),
            path: config.path.clone(),
            secret: config.secret.clone(),
            model_name: config.model_name.clone(),
        });
    }

    let api_key = hosted_key
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(ResolveError::Unauthorized)?;

    Ok(BackendTarget::Hosted {
        base_url: hosted_base.to_owned(),
        api_key: api_key.to_owned(),
        model: model_id.to_owned(),
    })
}

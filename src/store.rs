use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::{
    backend::registry::{self, BackendTarget, CustomApis, ResolveError, CUSTOM_MODEL_PREFIX},
    models::{ApiKeyStatus, CustomApiConfig, CustomApiInput, ModelEntry},
};

const API_CONFIGS: &str = "api_configs";
const API_KEY: &str = "api_key";

pub const HOSTED_MODELS: [(&str, &str); 7] = [
    ("deepseek/deepseek-chat-v3-0324:free", "DeepSeek Chat V3 0324 (Free)"),
    ("qwen/qwen3-235b-a22b:free", "Qwen3 235B A22B (Free)"),
    ("google/gemma-3-27b-it:free", "Google Gemma 3 27B IT (Free)"),
    ("qwen/qwen2.5-vl-72b-instruct:free", "Qwen2.5 VL 72B Instruct (Free)"),
    ("meta-llama/llama-4-scout:free", "Meta Llama 4 Scout (Free)"),
    ("google/gemini-2.0-flash-exp:free", "Google Gemini 2.0 Flash Exp (Free)"),
    ("deepseek/deepseek-r1:free", "DeepSeek R1 (Free)"),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("stored collection {collection} is not valid JSON: {source}")]
    Json {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Io {
                path: root.clone(),
                source,
            })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.json"))
    }

    pub async fn load<T>(&self, collection: &str) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path_for(collection);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_slice(&raw).map_err(|source| StoreError::Json {
            collection: collection.to_owned(),
            source,
        })
    }

    /// Replaces the document through a sibling `.tmp` file and a rename.
    pub async fn save<T>(&self, collection: &str, value: &T) -> Result<(), StoreError>
    where
        T: Serialize,
    {
        let path = self.path_for(collection);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            collection: collection.to_owned(),
            source,
        })?;

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApiKeyDocument {
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ConfigState {
    hosted_key: Option<String>,
    custom_apis: CustomApis,
}

pub struct ConfigStore {
    store: JsonStore,
    hosted_base: String,
    state: RwLock<ConfigState>,
}

impl ConfigStore {
    pub async fn load(store: JsonStore, hosted_base: impl Into<String>) -> Result<Self, StoreError> {
        let custom_apis: CustomApis = store.load(API_CONFIGS).await?;
        let key: ApiKeyDocument = store.load(API_KEY).await?;
        info!(
            data_dir = %store.root().display(),
            custom_apis = custom_apis.len(),
            has_hosted_key = key.api_key.is_some(),
            "configuration loaded"
        );

        Ok(Self {
            store,
            hosted_base: hosted_base.into(),
            state: RwLock::new(ConfigState {
                hosted_key: key.api_key.filter(|value| !value.trim().is_empty()),
                custom_apis,
            }),
        })
    }

    pub async fn resolve(&self, model_id: &str) -> Result<BackendTarget, ResolveError> {
        let state = self.state.read().await;
        registry::resolve(
            model_id,
            &state.custom_apis,
            state.hosted_key.as_deref(),
            &self.hosted_base,
        )
    }

    pub async fn set_hosted_key(&self, api_key: String) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = ApiKeyDocument {
            api_key: Some(api_key),
        };
        self.persist(API_KEY, &document).await?;
        state.hosted_key = document.api_key;
        Ok(())
    }

    pub async fn hosted_key_status(&self) -> ApiKeyStatus {
        let state = self.state.read().await;
        let key = state.hosted_key.as_deref().unwrap_or_default();
        ApiKeyStatus {
            has_key: !key.is_empty(),
            key_preview: key_preview(key),
        }
    }

    pub async fn custom_apis(&self) -> Vec<CustomApiConfig> {
        self.state.read().await.custom_apis.values().cloned().collect()
    }

    pub async fn add_custom_api(&self, config: CustomApiConfig) -> Result<CustomApiConfig, StoreError> {
        let mut state = self.state.write().await;
        let mut custom_apis = state.custom_apis.clone();
        custom_apis.insert(config.id.clone(), config.clone());
        self.persist(API_CONFIGS, &custom_apis).await?;
        state.custom_apis = custom_apis;

        info!(id = %config.id, name = %config.name, base_url = %config.base_url, "custom API added");
        Ok(config)
    }

    pub async fn update_custom_api(
        &self,
        id: &str,
        patch: CustomApiInput,
    ) -> Result<Option<CustomApiConfig>, StoreError> {
        let mut state = self.state.write().await;
        let mut custom_apis = state.custom_apis.clone();
        let Some(config) = custom_apis.get_mut(id) else {
            return Ok(None);
        };
        patch.apply_to(config);
        let updated = config.clone();

        self.persist(API_CONFIGS, &custom_apis).await?;
        state.custom_apis = custom_apis;

        info!(id, "custom API updated");
        Ok(Some(updated))
    }

    pub async fn delete_custom_api(&self, id: &str) -> Result<Option<CustomApiConfig>, StoreError> {
        let mut state = self.state.write().await;
        let mut custom_apis = state.custom_apis.clone();
        let Some(removed) = custom_apis.shift_remove(id) else {
            return Ok(None);
        };

        self.persist(API_CONFIGS, &custom_apis).await?;
        state.custom_apis = custom_apis;

        info!(id, name = %removed.name, "custom API deleted");
        Ok(Some(removed))
    }

    pub async fn model_catalog(&self) -> Vec<ModelEntry> {
        let state = self.state.read().await;
        HOSTED_MODELS
            .iter()
            .map(|(id, name)| ModelEntry {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
            })
            .chain(state.custom_apis.values().map(|config| ModelEntry {
                id: format!("{CUSTOM_MODEL_PREFIX}{}", config.id),
                name: format!("{} - {}", config.name, config.model_name),
            }))
            .collect()
    }

    async fn persist<T: Serialize>(&self, collection: &str, value: &T) -> Result<(), StoreError> {
        self.store.save(collection, value).await.inspect_err(|failure| {
            error!(collection, error = %failure, "failed to persist configuration");
        })
    }
}

fn key_preview(key: &str) -> Option<String> {
    let chars = key.chars().collect::<Vec<_>>();
    if chars.len() < 11 {
        return None;
    }
    let head = chars[..7].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    Some(format!("{head}...{tail}"))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn open_store(dir: &TempDir) -> ConfigStore {
        let json = JsonStore::open(dir.path()).await.expect("open store");
        ConfigStore::load(json, "https://hosted.example/api/v1")
            .await
            .expect("load config")
    }

    fn config(id: &str, name: &str) -> CustomApiConfig {
        CustomApiConfig {
            id: id.to_owned(),
            name: name.to_owned(),
            base_url: "http://localhost:11434/".to_owned(),
            path: "/v1/chat/completions".to_owned(),
            secret: String::new(),
            model_name: "llama3".to_owned(),
        }
    }

    #[test]
    fn key_preview_masks_middle() {
        assert_eq!(
            key_preview("sk-or-v1-abcdef123456"),
            Some("sk-or-v...3456".to_owned())
        );
        assert_eq!(key_preview("sk-short"), None);
    }

    #[tokio::test]
    async fn missing_collection_loads_default() {
        let dir = TempDir::new().expect("temp dir");
        let json = JsonStore::open(dir.path()).await.expect("open store");
        let loaded: CustomApis = json.load("absent").await.expect("load");
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn save_replaces_document_without_leaving_temp_file() {
        let dir = TempDir::new().expect("temp dir");
        let json = JsonStore::open(dir.path()).await.expect("open store");
        json.save("api_key", &ApiKeyDocument { api_key: Some("sk-1".to_owned()) })
            .await
            .expect("first save");
        json.save("api_key", &ApiKeyDocument { api_key: Some("sk-2".to_owned()) })
            .await
            .expect("second save");

        let loaded: ApiKeyDocument = json.load("api_key").await.expect("load");
        assert_eq!(loaded.api_key.as_deref(), Some("sk-2"));
        assert!(!dir.path().join("api_key.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_collection_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("api_configs.json"), "{oops").expect("write");
        let json = JsonStore::open(dir.path()).await.expect("open store");
        let result = ConfigStore::load(json, "https://hosted.example").await;
        assert!(matches!(result, Err(StoreError::Json { .. })));
    }

    #[tokio::test]
    async fn custom_api_mutations_survive_reload() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;

        let created = store
            .add_custom_api(config("ollama-1", "Ollama"))
            .await
            .expect("persist");
        store
            .update_custom_api(
                &created.id,
                CustomApiInput {
                    secret: Some("local-secret".to_owned()),
                    ..CustomApiInput::default()
                },
            )
            .await
            .expect("persist")
            .expect("known id");
        store.set_hosted_key("sk-or-v1-0123456789".to_owned()).await.expect("persist key");

        let reloaded = open_store(&dir).await;
        let apis = reloaded.custom_apis().await;
        assert_eq!(apis.len(), 1);
        assert_eq!(apis[0].secret, "local-secret");
        assert!(reloaded.hosted_key_status().await.has_key);

        let target = reloaded
            .resolve(&format!("custom-{}", created.id))
            .await
            .expect("resolves");
        assert_eq!(target.model_name(), "llama3");
    }

    #[tokio::test]
    async fn failed_persist_leaves_state_untouched() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        std::fs::create_dir(dir.path().join("api_configs.json")).expect("block target path");

        let result = store.add_custom_api(config("x", "blocked")).await;
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert!(store.custom_apis().await.is_empty());
    }

    #[tokio::test]
    async fn delete_unknown_id_returns_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        assert!(store.delete_custom_api("nope").await.expect("no I/O").is_none());
    }

    #[tokio::test]
    async fn custom_apis_keep_creation_order() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        for (id, name) in [("f3b1", "First added"), ("0a9c", "Second added"), ("7d2e", "Third added")] {
            store.add_custom_api(config(id, name)).await.expect("persist");
        }
        store.delete_custom_api("0a9c").await.expect("persist").expect("known id");

        let reloaded = open_store(&dir).await;
        let names = reloaded
            .custom_apis()
            .await
            .into_iter()
            .map(|config| config.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["First added", "Third added"]);

        let catalog = reloaded.model_catalog().await;
        let custom_ids = catalog[HOSTED_MODELS.len()..]
            .iter()
            .map(|entry| entry.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(custom_ids, vec!["custom-f3b1", "custom-7d2e"]);
    }

    #[tokio::test]
    async fn catalog_lists_hosted_then_custom_models() {
        let dir = TempDir::new().expect("temp dir");
        let store = open_store(&dir).await;
        let created = store
            .add_custom_api(config("ollama-1", "Ollama"))
            .await
            .expect("persist");

        let catalog = store.model_catalog().await;
        assert_eq!(catalog.len(), HOSTED_MODELS.len() + 1);
        let last = catalog.last().expect("custom entry");
        assert_eq!(last.id, format!("custom-{}", created.id));
        assert_eq!(last.name, "Ollama - llama3");
    }
}

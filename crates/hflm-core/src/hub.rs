//! Checkpoint resolution from the Hugging Face Hub or a local directory.

use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Cache, Repo, RepoType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::length::ContextConfig;

/// Where a checkpoint lives: a hub repo id (or local directory), a revision
/// and an optional subfolder inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointLocator {
    pub identifier: String,
    pub revision: String,
    pub subfolder: Option<String>,
}

impl CheckpointLocator {
    pub fn new(
        identifier: impl Into<String>,
        revision: impl Into<String>,
        subfolder: Option<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            revision: revision.into(),
            subfolder: subfolder.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Revision string with the subfolder appended, `main/onnx` style.
    ///
    /// This is the identity the checkpoint is logged and reported under.
    /// Hub requests address the subfolder through the file path instead.
    pub fn effective_revision(&self) -> String {
        match &self.subfolder {
            Some(sub) => format!("{}/{}", self.revision, sub),
            None => self.revision.clone(),
        }
    }

    /// Same repo and revision, different identifier (separate tokenizer repos).
    pub fn with_identifier(&self, identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..self.clone()
        }
    }

    pub fn is_local(&self) -> bool {
        Path::new(&self.identifier).is_dir()
    }

    fn repo_path(&self, file: &str) -> String {
        match &self.subfolder {
            Some(sub) => format!("{}/{}", sub.trim_end_matches('/'), file),
            None => file.to_string(),
        }
    }

    fn repo(&self) -> Repo {
        Repo::with_revision(
            self.identifier.clone(),
            RepoType::Model,
            self.revision.clone(),
        )
    }
}

/// Parse a checkpoint JSON file. Unreadable or malformed files are load
/// failures.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw =
        fs::read_to_string(path).map_err(|e| Error::load(format!("Reading {:?}", path), e))?;
    serde_json::from_str(&raw).map_err(|e| Error::load(format!("Parsing {:?}", path), e))
}

/// Fetches checkpoint files, caching them through `hf-hub`.
#[derive(Debug, Clone, Default)]
pub struct HubLoader {
    cache_dir: Option<PathBuf>,
    endpoint: Option<String>,
}

impl HubLoader {
    pub fn new(cache_dir: Option<PathBuf>) -> Self {
        Self {
            cache_dir,
            endpoint: None,
        }
    }

    /// Talk to a hub mirror instead of the `HF_ENDPOINT` default.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn api(&self) -> Result<Api> {
        let mut builder = ApiBuilder::from_env().with_progress(false);
        if let Some(dir) = &self.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        if let Ok(token) = std::env::var("HF_TOKEN") {
            builder = builder.with_token(Some(token));
        }
        builder.build().map_err(Error::from)
    }

    fn cache(&self) -> Cache {
        match &self.cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::from_env(),
        }
    }

    /// Local path of `file`, downloading it if needed.
    pub fn fetch(&self, locator: &CheckpointLocator, file: &str) -> Result<PathBuf> {
        let repo_path = locator.repo_path(file);
        if locator.is_local() {
            let path = Path::new(&locator.identifier).join(&repo_path);
            if path.is_file() {
                debug!("Using local checkpoint file {:?}", path);
                return Ok(path);
            }
            return Err(Error::LoadFailure(format!(
                "{} not found in local checkpoint {}",
                repo_path, locator.identifier
            )));
        }

        debug!(
            "Fetching {} from {}@{}",
            repo_path, locator.identifier, locator.revision
        );
        let repo = self.api()?.repo(locator.repo());
        repo.get(&repo_path).map_err(|e| {
            Error::load(
                format!(
                    "Fetching {} from {}@{}",
                    repo_path,
                    locator.identifier,
                    locator.effective_revision()
                ),
                e,
            )
        })
    }

    /// Like [`fetch`](Self::fetch) but a file the checkpoint does not ship
    /// is `Ok(None)`.
    ///
    /// Absence is decided from the local directory or the repo's file
    /// listing. Any other failure, network and auth errors included, is a
    /// load failure.
    pub fn fetch_optional(
        &self,
        locator: &CheckpointLocator,
        file: &str,
    ) -> Result<Option<PathBuf>> {
        let repo_path = locator.repo_path(file);
        if locator.is_local() {
            let path = Path::new(&locator.identifier).join(&repo_path);
            if !path.is_file() {
                debug!("Optional file {} absent from {}", repo_path, locator.identifier);
                return Ok(None);
            }
            return Ok(Some(path));
        }

        if let Some(path) = self.cache().repo(locator.repo()).get(&repo_path) {
            debug!("Using cached checkpoint file {:?}", path);
            return Ok(Some(path));
        }

        let info = self.api()?.repo(locator.repo()).info().map_err(|e| {
            Error::load(
                format!(
                    "Listing files of {}@{}",
                    locator.identifier,
                    locator.effective_revision()
                ),
                e,
            )
        })?;
        if !info.siblings.iter().any(|s| s.rfilename == repo_path) {
            debug!("Optional file {} absent from {}", repo_path, locator.identifier);
            return Ok(None);
        }
        self.fetch(locator, file).map(Some)
    }

    /// Weight files: a single `model.safetensors` or every shard listed in
    /// `model.safetensors.index.json`.
    pub fn fetch_safetensors(&self, locator: &CheckpointLocator) -> Result<Vec<PathBuf>> {
        if let Some(index_path) = self.fetch_optional(locator, "model.safetensors.index.json")? {
            let index: Value = read_json(&index_path)?;
            let weight_map = index
                .get("weight_map")
                .and_then(|m| m.as_object())
                .ok_or_else(|| {
                    Error::LoadFailure(
                        "Invalid model.safetensors.index.json format".to_string(),
                    )
                })?;

            let mut shard_files: Vec<String> = weight_map
                .values()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
            shard_files.sort();
            shard_files.dedup();
            info!("Checkpoint is sharded into {} files", shard_files.len());

            return shard_files
                .iter()
                .map(|file| self.fetch(locator, file))
                .collect();
        }

        Ok(vec![self.fetch(locator, "model.safetensors")?])
    }
}

/// The subset of `config.json` the adapter reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub torch_dtype: Option<String>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub auto_map: Option<Value>,
    #[serde(flatten)]
    pub context: ContextConfig,
    /// The full document, for model-specific parsing.
    #[serde(skip)]
    pub raw: Value,
}

impl CheckpointConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(json)?;
        // Multimodal checkpoints nest the language model under `text_config`.
        let text = raw.get("text_config").cloned().unwrap_or_else(|| raw.clone());
        let mut config: CheckpointConfig = serde_json::from_value(text.clone())?;
        if config.torch_dtype.is_none() {
            config.torch_dtype = raw
                .get("torch_dtype")
                .or_else(|| raw.get("dtype"))
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if config.model_type.is_none() {
            config.model_type = raw
                .get("model_type")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if config.auto_map.is_none() {
            config.auto_map = raw.get("auto_map").cloned();
        }
        config.raw = text;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).map_err(|e| Error::load(format!("Reading {:?}", path), e))?;
        Self::from_json_str(&raw)
    }

    pub fn load(hub: &HubLoader, locator: &CheckpointLocator) -> Result<Self> {
        let path = hub.fetch(locator, "config.json")?;
        Self::from_file(&path)
            .map_err(|e| Error::load(format!("Parsing config.json of {}", locator.identifier), e))
    }

    /// Checkpoints that ship their own modelling code.
    pub fn requires_remote_code(&self) -> bool {
        self.auto_map.is_some()
    }

    /// Refuse checkpoints whose code the caller did not opt into.
    pub fn check_remote_code(&self, identifier: &str, trust_remote_code: bool) -> Result<()> {
        if self.requires_remote_code() && !trust_remote_code {
            return Err(Error::LoadFailure(format!(
                "{identifier} declares custom modelling code (auto_map); pass trust_remote_code=true to load it with the native decoder"
            )));
        }
        Ok(())
    }
}

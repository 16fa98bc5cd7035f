//! Engine configuration: YAML file + environment overrides
//!
//! Lookup order: `--config <path>` if given, else
//! `<config dir>/casebook/config.yaml` if it exists, else defaults.
//! `CASEBOOK_DATA_DIR` and `CASEBOOK_LLM_API_KEY` override the file.

use crate::embeddings::{
    get_model_dir, CachedEmbedder, EmbeddingGateway, HashEmbedder, HttpEmbedder, OnnxEmbedder,
    MINILM_DIM,
};
use crate::error::{EngineError, Result};
use crate::llm::LlmConfig;
use crate::memory::RetrievalPolicy;
use crate::types::Horizon;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Longest horizon accepted in configuration (about ten years)
pub const MAX_HORIZON_DAYS: u64 = 3660;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Feature hashing, offline and deterministic
    Hash,
    /// Local all-MiniLM-L6-v2
    Onnx,
    /// OpenAI-compatible `/embeddings` endpoint
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimension: usize,
    /// Model name for the HTTP provider
    pub model: String,
    /// Base URL for the HTTP provider; falls back to the LLM base URL
    pub api_url: Option<String>,
    pub model_dir: Option<PathBuf>,
    /// Memoize embeddings by text hash in `<data_dir>/embeddings.db`
    pub cache: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hash,
            dimension: MINILM_DIM,
            model: "embedding-query".to_string(),
            api_url: None,
            model_dir: None,
            cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Critique budget per subject
    pub max_iterations: u32,
    pub top_k: usize,
    pub retrieval: RetrievalPolicy,
    pub horizons: Vec<Horizon>,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_iterations: 2,
            top_k: 5,
            retrieval: RetrievalPolicy::default(),
            horizons: Horizon::defaults(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("casebook")
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("casebook").join("config.yaml"))
}

impl EngineConfig {
    /// Load, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("CASEBOOK_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(key) = lookup("CASEBOOK_LLM_API_KEY").filter(|v| !v.is_empty()) {
            self.llm.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(EngineError::Config("max_iterations must be at least 1".into()));
        }
        if self.retrieval.min_population == 0 {
            return Err(EngineError::Config("retrieval.min_population must be at least 1".into()));
        }
        if self.top_k == 0 {
            return Err(EngineError::Config("top_k must be at least 1".into()));
        }
        if self.horizons.is_empty() {
            return Err(EngineError::Config("at least one horizon is required".into()));
        }
        if let Some(h) = self.horizons.iter().find(|h| h.approx_days() > MAX_HORIZON_DAYS) {
            return Err(EngineError::Config(format!(
                "horizon {} exceeds the {}-day maximum",
                h, MAX_HORIZON_DAYS
            )));
        }
        if self.embedding.dimension == 0 {
            return Err(EngineError::Config("embedding.dimension must be positive".into()));
        }
        if self.embedding.provider == EmbeddingProvider::Onnx
            && self.embedding.dimension != MINILM_DIM
        {
            return Err(EngineError::Config(format!(
                "onnx provider produces {}-dimensional vectors, config says {}",
                MINILM_DIM, self.embedding.dimension
            )));
        }
        if let Some(min) = self.retrieval.min_similarity {
            if !(-1.0..=1.0).contains(&min) {
                return Err(EngineError::Config(
                    "retrieval.min_similarity must be within [-1, 1]".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn cases_db_path(&self) -> PathBuf {
        self.data_dir.join("cases.db")
    }

    pub fn prices_db_path(&self) -> PathBuf {
        self.data_dir.join("prices.db")
    }

    pub fn embedding_cache_path(&self) -> PathBuf {
        self.data_dir.join("embeddings.db")
    }

    /// Cache namespace: vectors from another provider, model or width never match
    fn embedding_namespace(&self) -> String {
        let e = &self.embedding;
        let model = match e.provider {
            EmbeddingProvider::Hash => "feature-hash",
            EmbeddingProvider::Onnx => "all-MiniLM-L6-v2",
            EmbeddingProvider::Http => e.model.as_str(),
        };
        format!("{:?}:{}:{}", e.provider, model, e.dimension).to_lowercase()
    }

    /// Build the configured embedding gateway
    pub fn build_gateway(&self) -> anyhow::Result<Box<dyn EmbeddingGateway>> {
        let e = &self.embedding;
        let base: Box<dyn EmbeddingGateway> = match e.provider {
            EmbeddingProvider::Hash => Box::new(HashEmbedder::new(e.dimension)),
            EmbeddingProvider::Onnx => {
                let dir = e.model_dir.clone().unwrap_or_else(get_model_dir);
                Box::new(OnnxEmbedder::new(&dir)?)
            }
            EmbeddingProvider::Http => {
                let url = e.api_url.as_deref().unwrap_or(&self.llm.api_url);
                Box::new(HttpEmbedder::new(url, &self.llm.api_key, &e.model, e.dimension)?)
            }
        };

        if e.cache {
            let cached = CachedEmbedder::persistent(
                base,
                &self.embedding_cache_path(),
                &self.embedding_namespace(),
            )?;
            Ok(Box::new(cached))
        } else {
            Ok(base)
        }
    }
}

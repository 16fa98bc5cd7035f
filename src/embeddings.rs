//! Embedding gateways
//!
//! Everything that turns text into a fixed-length vector lives here:
//!
//! - [`HashEmbedder`]: deterministic feature hashing, offline, no model
//! - [`OnnxEmbedder`]: local all-MiniLM-L6-v2 through ONNX Runtime (384 dims)
//! - [`HttpEmbedder`]: OpenAI-compatible `/embeddings` endpoint
//! - [`CachedEmbedder`]: content-addressed cache in front of any of the above,
//!   optionally persisted to SQLite
//!
//! All gateways return L2-normalised vectors, so cosine similarity is a dot
//! product. Empty text embeds to the zero vector without touching the backend.

use crate::db;
use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Embedding dimensions for all-MiniLM-L6-v2
pub const MINILM_DIM: usize = 384;

/// Maximum sequence length for the model
const MAX_SEQ_LEN: usize = 256;

/// Texts per request for remote embedding APIs
const HTTP_BATCH_SIZE: usize = 20;

/// Converts text into a fixed-length vector.
///
/// Implementations must be pure functions of their input apart from an
/// opaque cache.
pub trait EmbeddingGateway {
    /// Length of every vector this gateway returns
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

impl<G: EmbeddingGateway + ?Sized> EmbeddingGateway for Box<G> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }

    fn embed_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        (**self).embed_many(texts)
    }
}

/// L2 normalize a vector
pub fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.iter().map(|x| x / norm).collect()
    } else {
        vec.to_vec()
    }
}

/// Cosine similarity between two vectors.
///
/// Does not assume normalised input; a zero vector scores 0 against anything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Hex SHA-256 of the text, used as cache key
pub fn text_key(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

// ============================================================================
// Feature hashing
// ============================================================================

/// Deterministic bag-of-words embedder.
///
/// Unigrams and bigrams are hashed into `dimension` signed buckets. Useful
/// offline and in tests: identical text always yields an identical vector and
/// overlapping vocabulary yields positive similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .collect()
    }

    fn bump(&self, acc: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut idx_bytes = [0u8; 8];
        idx_bytes.copy_from_slice(&digest[..8]);
        let idx = (u64::from_le_bytes(idx_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        acc[idx] += sign * weight;
    }
}

impl EmbeddingGateway for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimension == 0 {
            return Err(anyhow!("hash embedder configured with zero dimension"));
        }
        let mut acc = vec![0.0f32; self.dimension];
        let tokens = Self::tokens(text);
        for token in &tokens {
            self.bump(&mut acc, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.bump(&mut acc, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        Ok(l2_normalize(&acc))
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Vec<f32>>,
    hits: usize,
    disk_hits: usize,
    misses: usize,
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    /// Served from memory or disk
    pub hits: usize,
    /// Subset of `hits` loaded from the on-disk cache
    pub disk_hits: usize,
    pub misses: usize,
}

/// On-disk side of the cache, scoped to one gateway configuration
struct CacheStore {
    conn: Mutex<Connection>,
    namespace: String,
}

/// Content-addressed cache in front of another gateway.
///
/// Lookups go memory, then disk (if persistent), then the wrapped gateway.
pub struct CachedEmbedder<G> {
    inner: G,
    state: Mutex<CacheState>,
    store: Option<CacheStore>,
}

impl<G: EmbeddingGateway> CachedEmbedder<G> {
    /// In-memory cache for the life of this value
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            state: Mutex::new(CacheState::default()),
            store: None,
        }
    }

    /// Cache backed by SQLite at `path`, shared across runs.
    ///
    /// `namespace` must identify the wrapped gateway (provider, model,
    /// dimension) so vectors from different models never mix.
    pub fn persistent(inner: G, path: &Path, namespace: &str) -> Result<Self> {
        let conn = db::init_cache_db(path)?;
        debug!(path = %path.display(), namespace, "persistent embedding cache");
        Ok(Self {
            inner,
            state: Mutex::new(CacheState::default()),
            store: Some(CacheStore {
                conn: Mutex::new(conn),
                namespace: namespace.to_string(),
            }),
        })
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            disk_hits: state.disk_hits,
            misses: state.misses,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        // Entries are inserted whole, so a poisoned map is still valid
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_from_disk(&self, key: &str) -> Result<Option<Vec<f32>>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let conn = store.conn.lock().unwrap_or_else(|e| e.into_inner());
        let vector = db::get_cached_embedding(&conn, &store.namespace, key)?;
        Ok(vector.filter(|v| v.len() == self.inner.dimension()))
    }

    fn save_to_disk(&self, fresh: &[(String, Vec<f32>)]) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let conn = store.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.unchecked_transaction()?;
        for (key, vector) in fresh {
            db::put_cached_embedding(&tx, &store.namespace, key, vector)?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl<G: EmbeddingGateway> EmbeddingGateway for CachedEmbedder<G> {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_many(&[text])?.remove(0))
    }

    fn embed_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let dim = self.inner.dimension();
        let mut results: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        let mut miss_texts: Vec<&str> = Vec::new();
        let mut miss_indices: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if text.is_empty() {
                results.push(Some(vec![0.0; dim]));
                continue;
            }
            let key = text_key(text);
            if let Some(v) = self.lock().entries.get(&key).cloned() {
                self.lock().hits += 1;
                results.push(Some(v));
                continue;
            }
            if let Some(v) = self.load_from_disk(&key)? {
                let mut state = self.lock();
                state.hits += 1;
                state.disk_hits += 1;
                state.entries.insert(key, v.clone());
                results.push(Some(v));
                continue;
            }
            self.lock().misses += 1;
            results.push(None);
            miss_texts.push(*text);
            miss_indices.push(i);
        }

        if !miss_texts.is_empty() {
            debug!(misses = miss_texts.len(), "embedding cache miss");
            let fresh = self.inner.embed_many(&miss_texts)?;
            if fresh.len() != miss_texts.len() {
                return Err(anyhow!(
                    "gateway returned {} vectors for {} texts",
                    fresh.len(),
                    miss_texts.len()
                ));
            }

            let keyed: Vec<(String, Vec<f32>)> = miss_texts
                .iter()
                .map(|t| text_key(t))
                .zip(fresh)
                .collect();
            self.save_to_disk(&keyed)?;

            let mut state = self.lock();
            for ((key, vector), idx) in keyed.into_iter().zip(&miss_indices) {
                state.entries.insert(key, vector.clone());
                results[*idx] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|r| r.ok_or_else(|| anyhow!("embedding slot left empty")))
            .collect()
    }
}

// ============================================================================
// Local ONNX model
// ============================================================================

/// Local embedding model (all-MiniLM-L6-v2, 22MB, runs on CPU)
pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

impl OnnxEmbedder {
    /// Load the model from `model_dir`, downloading it first if missing
    pub fn new(model_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(model_dir)?;

        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            Self::download_model(model_dir)?;
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("Failed to load ONNX model")?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        info!(model = %model_path.display(), "loaded local embedding model");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    /// Download the embedding model from HuggingFace
    fn download_model(model_dir: &Path) -> Result<()> {
        use hf_hub::api::sync::Api;

        info!("downloading embedding model (all-MiniLM-L6-v2)");
        let api = Api::new()?;
        let repo = api.model("sentence-transformers/all-MiniLM-L6-v2".to_string());

        let model_path = repo.get("onnx/model.onnx")?;
        std::fs::copy(&model_path, model_dir.join("model.onnx"))?;

        let tokenizer_path = repo.get("tokenizer.json")?;
        std::fs::copy(&tokenizer_path, model_dir.join("tokenizer.json"))?;

        info!("embedding model downloaded");
        Ok(())
    }

    /// Mean pooling over the sequence dimension of a flat
    /// `[1, seq_len, embedding_dim]` tensor
    fn mean_pool_flat(data: &[f32], seq_len: usize, shape: &[i64]) -> Vec<f32> {
        let mut result = vec![0.0f32; MINILM_DIM];
        if seq_len == 0 {
            return result;
        }

        let embed_dim = if shape.len() >= 3 {
            shape[2] as usize
        } else {
            MINILM_DIM
        };

        for i in 0..seq_len {
            for (j, slot) in result.iter_mut().enumerate().take(embed_dim) {
                if let Some(v) = data.get(i * embed_dim + j) {
                    *slot += v;
                }
            }
        }

        for v in result.iter_mut() {
            *v /= seq_len as f32;
        }

        result
    }
}

impl EmbeddingGateway for OnnxEmbedder {
    fn dimension(&self) -> usize {
        MINILM_DIM
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Ok(vec![0.0; MINILM_DIM]);
        }

        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let len = encoding.get_ids().len().min(MAX_SEQ_LEN);
        let ids: Vec<i64> = encoding.get_ids()[..len].iter().map(|&id| id as i64).collect();
        let attention_mask: Vec<i64> = encoding.get_attention_mask()[..len]
            .iter()
            .map(|&m| m as i64)
            .collect();
        let token_type_ids: Vec<i64> = vec![0i64; len];

        let input_ids = Array2::from_shape_vec((1, len), ids)?;
        let attention = Array2::from_shape_vec((1, len), attention_mask)?;
        let token_types = Array2::from_shape_vec((1, len), token_type_ids)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("embedding session lock poisoned"))?;

        let outputs = session.run(inputs![
            "input_ids" => Tensor::from_array(input_ids)?,
            "attention_mask" => Tensor::from_array(attention)?,
            "token_type_ids" => Tensor::from_array(token_types)?,
        ])?;

        let output = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .ok_or_else(|| anyhow!("No embedding output found"))?;

        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let shape_vec: Vec<i64> = shape.iter().copied().collect();
        let data_vec: Vec<f32> = data.to_vec();
        drop(outputs);

        Ok(l2_normalize(&Self::mean_pool_flat(&data_vec, len, &shape_vec)))
    }
}

/// Default location of the local model files
pub fn get_model_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("casebook")
        .join("models")
        .join("minilm")
}

// ============================================================================
// Remote API
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [&'a str],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

/// OpenAI-compatible embeddings endpoint (Upstage, OpenAI, local servers)
pub struct HttpEmbedder {
    client: reqwest::blocking::Client,
    api_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    pub fn new(api_url: &str, api_key: &str, model: &str, dimension: usize) -> Result<Self> {
        if api_key.is_empty() {
            return Err(anyhow!("embedding API key not set"));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            dimension,
        })
    }

    fn embed_batch(&self, batch: &[&str]) -> Result<Vec<Vec<f32>>> {
        let response: EmbeddingResponse = self
            .client
            .post(format!("{}/embeddings", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                input: batch,
                model: &self.model,
            })
            .send()
            .context("embedding request failed")?
            .error_for_status()?
            .json()
            .context("embedding response was not valid JSON")?;

        if response.data.len() != batch.len() {
            return Err(anyhow!(
                "embedding API returned {} vectors for {} inputs",
                response.data.len(),
                batch.len()
            ));
        }

        let mut data = response.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }

        data.into_iter()
            .map(|d| {
                if d.embedding.len() != self.dimension {
                    Err(anyhow!(
                        "embedding API returned {} dims, expected {}",
                        d.embedding.len(),
                        self.dimension
                    ))
                } else {
                    Ok(l2_normalize(&d.embedding))
                }
            })
            .collect()
    }
}

impl EmbeddingGateway for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_many(&[text])?.remove(0))
    }

    fn embed_many(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = vec![Vec::new(); texts.len()];
        let pending: Vec<(usize, &str)> = texts
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_empty())
            .map(|(i, t)| (i, *t))
            .collect();

        for (i, t) in texts.iter().enumerate() {
            if t.is_empty() {
                out[i] = vec![0.0; self.dimension];
            }
        }

        for chunk in pending.chunks(HTTP_BATCH_SIZE) {
            let batch: Vec<&str> = chunk.iter().map(|(_, t)| *t).collect();
            let vectors = self.embed_batch(&batch)?;
            for ((i, _), v) in chunk.iter().zip(vectors) {
                out[*i] = v;
            }
        }

        Ok(out)
    }
}

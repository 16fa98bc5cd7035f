//! Case memory: decision ledger + vector index + feedback ledger
//!
//! Every finalized decision is stored with its embedding; later queries
//! retrieve the most similar past decisions together with how they turned out.
//!
//! Write discipline for [`CaseMemory::record`]:
//! 1. take the index write lock (single writer)
//! 2. insert the decision row and the vector row in one SQLite transaction
//! 3. only after commit, append vector and id to the in-memory index together
//!
//! A failure at step 2 rolls back both rows and leaves the index untouched, so
//! the ledger, the persisted vectors and the in-memory arrays never disagree.

use crate::db;
use crate::embeddings::EmbeddingGateway;
use crate::error::{EngineError, Result, Stage};
use crate::index::VectorIndex;
use crate::types::{
    Decision, Embedding, FeedbackRecord, FeedbackStatus, RecordStatus, Retrieval, SimilarCase,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Smallest corpus for which similarity search is considered meaningful
pub const DEFAULT_MIN_POPULATION: usize = 5;

/// How `find_similar` filters its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalPolicy {
    /// Below this many indexed decisions, return `InsufficientData`
    pub min_population: usize,
    /// Skip neighbours that have no feedback record yet
    pub require_feedback: bool,
    /// Drop neighbours scoring below this cosine similarity
    pub min_similarity: Option<f32>,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            min_population: DEFAULT_MIN_POPULATION,
            require_feedback: true,
            min_similarity: None,
        }
    }
}

/// Snapshot of case memory size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub population: usize,
    pub with_feedback: usize,
    pub dimension: usize,
    pub min_population: usize,
}

pub struct CaseMemory {
    conn: Mutex<Connection>,
    index: RwLock<VectorIndex>,
    policy: RetrievalPolicy,
    path: PathBuf,
}

impl CaseMemory {
    /// Open (or create) case memory at `path` for vectors of `dimension`.
    ///
    /// The dimension is fixed when the database is created; reopening with a
    /// different one fails with [`EngineError::DimensionMismatch`].
    pub fn open(path: &Path, dimension: usize, policy: RetrievalPolicy) -> Result<Self> {
        if dimension == 0 {
            return Err(EngineError::Config("embedding dimension must be positive".into()));
        }
        if policy.min_population == 0 {
            return Err(EngineError::Config("min_population must be at least 1".into()));
        }

        let conn = db::init_db(path)?;

        match db::get_index_dimension(&conn)? {
            Some(stored) if stored != dimension => {
                return Err(EngineError::DimensionMismatch {
                    expected: stored,
                    actual: dimension,
                });
            }
            Some(_) => {}
            None => db::set_index_dimension(&conn, dimension)?,
        }

        let index = VectorIndex::from_rows(dimension, db::load_vectors(&conn)?)?;
        let decisions = db::count_decisions(&conn)?;
        if decisions != index.len() {
            return Err(EngineError::CorruptIndex(format!(
                "{} decisions in ledger but {} indexed vectors",
                decisions,
                index.len()
            )));
        }

        info!(
            path = %path.display(),
            population = index.len(),
            dimension,
            "case memory opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            index: RwLock::new(index),
            policy,
            path: path.to_path_buf(),
        })
    }

    /// Flush and close the underlying database.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(|e| e.into_inner());
        conn.close().map_err(|(_, e)| EngineError::Sqlite(e))?;
        debug!(path = %self.path.display(), "case memory closed");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    pub fn dimension(&self) -> usize {
        self.read_index().dimension()
    }

    /// Number of decisions in the vector index
    pub fn population(&self) -> usize {
        self.read_index().len()
    }

    // Poisoned locks are recovered: every read re-checks index consistency.
    fn read_index(&self) -> RwLockReadGuard<'_, VectorIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, VectorIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verify vectors and ids have the same length
    pub fn check_consistency(&self) -> Result<()> {
        self.read_index().check_consistency()
    }

    /// Persist a decision with its embedding. Idempotent on `correlation_id`.
    pub fn record(&self, decision: &Decision, embedding: &Embedding) -> Result<RecordStatus> {
        if embedding.correlation_id != decision.correlation_id {
            return Err(EngineError::InvalidRecord(format!(
                "embedding for {} attached to decision {}",
                embedding.correlation_id, decision.correlation_id
            )));
        }

        let mut index = self.write_index();
        index.check_dimension(&embedding.vector)?;
        index.check_consistency()?;

        let conn = self.conn();
        let id = decision.correlation_id.as_str();

        if db::decision_exists(&conn, id)? {
            if !index.contains(id) {
                return Err(EngineError::CorruptIndex(format!(
                    "{} is in the ledger but not in the index",
                    id
                )));
            }
            debug!(correlation_id = id, "decision already recorded");
            return Ok(RecordStatus::AlreadyRecorded);
        }

        let position = index.next_position();
        let tx = conn.unchecked_transaction()?;
        db::insert_decision(&tx, decision)?;
        db::insert_vector(&tx, position, id, &embedding.vector)?;
        tx.commit()?;

        let appended = index.append(id, embedding.vector.clone())?;
        if appended != position {
            return Err(EngineError::IndexDesync {
                vectors: index.len(),
                ids: index.id_count(),
            });
        }
        index.check_consistency()?;

        info!(
            correlation_id = id,
            subject = %decision.subject_id,
            verdict = decision.verdict,
            position,
            "decision recorded"
        );
        Ok(RecordStatus::Recorded { position })
    }

    /// Find past decisions similar to `query_text`.
    ///
    /// Returns [`Retrieval::InsufficientData`] without embedding anything when
    /// fewer than `min_population` decisions are indexed.
    pub fn find_similar(
        &self,
        gateway: &dyn EmbeddingGateway,
        query_text: &str,
        top_k: usize,
    ) -> Result<Retrieval> {
        let population = self.population();
        if population < self.policy.min_population {
            debug!(population, required = self.policy.min_population, "too few cases");
            return Ok(Retrieval::InsufficientData {
                population,
                required: self.policy.min_population,
            });
        }

        let query = gateway
            .embed(query_text)
            .map_err(|e| EngineError::collaborator(Stage::Embed, e))?;

        self.find_similar_by_vector(&query, top_k)
    }

    /// Same as [`CaseMemory::find_similar`] with a precomputed query vector.
    pub fn find_similar_by_vector(&self, query: &[f32], top_k: usize) -> Result<Retrieval> {
        let index = self.read_index();
        index.check_consistency()?;

        let population = index.len();
        if population < self.policy.min_population {
            return Ok(Retrieval::InsufficientData {
                population,
                required: self.policy.min_population,
            });
        }
        if top_k == 0 {
            return Ok(Retrieval::Cases { cases: Vec::new() });
        }

        let hits = index.nearest(query, population)?;
        let conn = self.conn();
        let mut cases = Vec::with_capacity(top_k);

        for hit in hits {
            if cases.len() >= top_k {
                break;
            }
            if let Some(min) = self.policy.min_similarity {
                if hit.score < min {
                    break;
                }
            }

            let id = index.id_at(hit.position).ok_or(EngineError::IndexDesync {
                vectors: index.len(),
                ids: index.id_count(),
            })?;
            let decision = db::get_decision(&conn, id)?.ok_or_else(|| {
                EngineError::CorruptIndex(format!("indexed id {} has no ledger row", id))
            })?;
            let feedback = db::get_feedback(&conn, id)?;

            if feedback.is_none() && self.policy.require_feedback {
                continue;
            }

            cases.push(SimilarCase {
                position: hit.position,
                similarity: hit.score,
                decision,
                feedback,
            });
        }

        debug!(returned = cases.len(), top_k, "similar cases retrieved");
        Ok(Retrieval::Cases { cases })
    }

    pub fn get_decision(&self, correlation_id: &str) -> Result<Option<Decision>> {
        db::get_decision(&self.conn(), correlation_id)
    }

    pub fn get_feedback(&self, correlation_id: &str) -> Result<Option<FeedbackRecord>> {
        db::get_feedback(&self.conn(), correlation_id)
    }

    /// Write a feedback record unless one already exists for the id.
    ///
    /// Returns the stored record either way; an existing record is never
    /// overwritten.
    pub fn store_feedback(&self, record: &FeedbackRecord) -> Result<FeedbackStatus> {
        let conn = self.conn();
        if let Some(existing) = db::get_feedback(&conn, &record.correlation_id)? {
            if existing.returns != record.returns {
                warn!(
                    correlation_id = %record.correlation_id,
                    "feedback already recorded with different returns; keeping stored record"
                );
            }
            return Ok(FeedbackStatus::AlreadyRecorded(existing));
        }
        if !db::decision_exists(&conn, &record.correlation_id)? {
            return Err(EngineError::InvalidRecord(format!(
                "feedback for unknown decision {}",
                record.correlation_id
            )));
        }
        db::insert_feedback(&conn, record)?;
        Ok(FeedbackStatus::Recorded(record.clone()))
    }

    /// Decisions still waiting for feedback, oldest first
    pub fn pending_feedback(&self) -> Result<Vec<Decision>> {
        db::decisions_without_feedback(&self.conn())
    }

    /// Every decision joined with its feedback
    pub fn graded_decisions(&self) -> Result<Vec<(Decision, FeedbackRecord)>> {
        db::decisions_with_feedback(&self.conn())
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let (population, dimension) = {
            let index = self.read_index();
            (index.len(), index.dimension())
        };
        Ok(MemoryStats {
            population,
            with_feedback: db::count_feedback(&self.conn())?,
            dimension,
            min_population: self.policy.min_population,
        })
    }
}

/// Print case memory statistics in a human-readable format
pub fn print_memory_stats(stats: &MemoryStats) {
    println!("\nCASE MEMORY");
    println!("   Decisions indexed: {}", stats.population);
    println!("   With feedback:     {}", stats.with_feedback);
    println!("   Vector dimension:  {}", stats.dimension);
    if stats.population < stats.min_population {
        println!(
            "   Retrieval inactive: {} more decision(s) needed",
            stats.min_population - stats.population
        );
    }
    println!();
}

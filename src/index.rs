//! Append-only vector index with exact nearest-neighbour search.
//!
//! Position N holds the Nth appended vector and the Nth correlation id. The two
//! arrays only grow together through [`VectorIndex::append`].

use crate::db::VectorRow;
use crate::embeddings::cosine_similarity;
use crate::error::{EngineError, Result};
use std::collections::HashMap;

/// One search hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub position: usize,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    ids: Vec<String>,
    positions: HashMap<String, usize>,
}

impl VectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
            ids: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Rebuild from persisted rows, which must be ordered by position and
    /// contiguous from zero.
    pub fn from_rows(dimension: usize, rows: Vec<VectorRow>) -> Result<Self> {
        let mut index = Self::new(dimension);
        for (expected, (position, id, vector)) in rows.into_iter().enumerate() {
            if position != expected {
                return Err(EngineError::CorruptIndex(format!(
                    "gap in persisted positions: expected {}, found {}",
                    expected, position
                )));
            }
            if index.positions.contains_key(&id) {
                return Err(EngineError::CorruptIndex(format!("duplicate id {}", id)));
            }
            index.append(&id, vector)?;
        }
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn id_count(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.positions.contains_key(correlation_id)
    }

    pub fn id_at(&self, position: usize) -> Option<&str> {
        self.ids.get(position).map(String::as_str)
    }

    pub fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Vectors and ids must always have the same length.
    pub fn check_consistency(&self) -> Result<()> {
        if self.vectors.len() != self.ids.len() {
            return Err(EngineError::IndexDesync {
                vectors: self.vectors.len(),
                ids: self.ids.len(),
            });
        }
        Ok(())
    }

    /// Position the next append will occupy
    pub fn next_position(&self) -> usize {
        self.vectors.len()
    }

    /// Append a vector and its id together, returning the position.
    pub fn append(&mut self, correlation_id: &str, vector: Vec<f32>) -> Result<usize> {
        self.check_dimension(&vector)?;
        self.check_consistency()?;
        if self.positions.contains_key(correlation_id) {
            return Err(EngineError::InvalidRecord(format!(
                "{} already indexed",
                correlation_id
            )));
        }

        let position = self.vectors.len();
        self.vectors.push(vector);
        self.ids.push(correlation_id.to_string());
        self.positions.insert(correlation_id.to_string(), position);
        Ok(position)
    }

    /// Rank every stored vector against `query` (cosine, highest first) and
    /// return the top `k`. Equal scores keep insertion order.
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        self.check_dimension(query)?;
        self.check_consistency()?;

        let mut hits: Vec<Neighbor> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, v)| Neighbor {
                position,
                score: cosine_similarity(query, v),
            })
            .collect();

        // sort_by is stable, so ties stay in position order
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

//! casebook - bounded critique loop + case memory for investment decisions
//!
//! Drafts are critiqued and revised until accepted or a retry budget runs out.
//! The resulting decision is conditioned on similar past decisions, recorded
//! with its embedding, and later graded against realized returns.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use casebook::{CaseMemory, DecisionPipeline, EngineConfig, RevisionMachine};
//! use casebook::outcome::{OutcomeTracker, PlainSummarizer};
//! use casebook::market::PriceHistory;
//!
//! let config = EngineConfig::load(None)?;
//! let gateway = config.build_gateway()?;
//! let memory = CaseMemory::open(&config.cases_db_path(), gateway.dimension(), config.retrieval.clone())?;
//!
//! // Draft, critique, decide, record
//! let pipeline = DecisionPipeline::new(
//!     RevisionMachine::new(config.max_iterations)?,
//!     &memory, gateway.as_ref(), &drafter, &critic, &synthesizer,
//! );
//! let report = pipeline.run(&subjects, as_of, None)?;
//!
//! // Later: grade decisions whose horizons have passed (THE FEEDBACK LOOP)
//! let prices = PriceHistory::open(&config.prices_db_path())?;
//! let tracker = OutcomeTracker::new(&memory, &prices, &PlainSummarizer, &config.horizons)?;
//! tracker.sweep()?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! Drafter ⇄ Critic            RevisionMachine (≤ max_iterations critiques)
//!        │
//!        ▼
//! CaseMemory::find_similar    VectorIndex + decision ledger + feedback ledger
//!        │
//!        ▼
//! DecisionSynthesizer ──► CaseMemory::record
//!                                │
//!                                ▼ (horizons later)
//!                         OutcomeTracker ──► feedback ledger
//! ```

pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod llm;
pub mod market;
pub mod memory;
pub mod outcome;
pub mod pipeline;
pub mod revision;
pub mod types;

// Core types
pub use error::{EngineError, ParseError, Result, Stage};
pub use types::*;

// Configuration
pub use config::{EmbeddingProvider, EngineConfig};

// Revision loop
pub use revision::{Critic, Critique, CritiqueReply, Drafter, Phase, RevisionMachine, RevisionOutcome};

// Case memory
pub use index::{Neighbor, VectorIndex};
pub use memory::{CaseMemory, MemoryStats, RetrievalPolicy};

// Outcome tracking (THE FEEDBACK LOOP)
pub use outcome::{AccuracyReport, MarketData, OutcomeSummarizer, OutcomeTracker, SweepReport};

// Embeddings
pub use embeddings::{CachedEmbedder, EmbeddingGateway, HashEmbedder, get_model_dir};

// Pipeline
pub use pipeline::{BatchReport, DecisionPipeline, DecisionSynthesizer, Synthesis};

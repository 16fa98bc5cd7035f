//! Per-subject decision pipeline
//!
//! revision run → similar-case lookup → synthesis → record.
//! Subjects are processed one at a time; a collaborator failure skips that
//! subject and the batch carries on. Fatal storage errors stop the batch.

use crate::embeddings::EmbeddingGateway;
use crate::error::{EngineError, ParseError, Result, Stage};
use crate::memory::CaseMemory;
use crate::revision::{strip_code_fence, Critic, Drafter, RevisionMachine, RevisionOutcome};
use crate::types::{correlation_id, Decision, Embedding, RecordStatus, Retrieval};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Final decision produced from a revision outcome and its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synthesis {
    /// true = include, false = reject
    pub verdict: bool,
    pub rationale: String,
}

impl Synthesis {
    pub fn from_json(raw: &str) -> std::result::Result<Self, ParseError> {
        serde_json::from_str(strip_code_fence(raw))
            .map_err(|e| ParseError::new("decision", e.to_string()))
    }
}

/// Combines the terminal draft, similar past cases and market context.
pub trait DecisionSynthesizer {
    fn synthesize(
        &self,
        subject_id: &str,
        outcome: &RevisionOutcome,
        similar: &Retrieval,
        market_context: Option<&str>,
    ) -> anyhow::Result<Synthesis>;
}

/// What happened to one subject.
#[derive(Debug, Clone, PartialEq)]
pub enum SubjectResult {
    Recorded {
        decision: Decision,
        revision: RevisionOutcome,
        similar_cases: usize,
    },
    /// A decision for this subject and date already exists; nothing was run
    AlreadyRecorded { correlation_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub recorded: Vec<Decision>,
    pub already_recorded: Vec<String>,
    /// (subject, error message)
    pub skipped: Vec<(String, String)>,
}

pub struct DecisionPipeline<'a> {
    machine: RevisionMachine,
    memory: &'a CaseMemory,
    gateway: &'a dyn EmbeddingGateway,
    drafter: &'a dyn Drafter,
    critic: &'a dyn Critic,
    synthesizer: &'a dyn DecisionSynthesizer,
    top_k: usize,
}

impl<'a> DecisionPipeline<'a> {
    pub fn new(
        machine: RevisionMachine,
        memory: &'a CaseMemory,
        gateway: &'a dyn EmbeddingGateway,
        drafter: &'a dyn Drafter,
        critic: &'a dyn Critic,
        synthesizer: &'a dyn DecisionSynthesizer,
    ) -> Self {
        Self {
            machine,
            memory,
            gateway,
            drafter,
            critic,
            synthesizer,
            top_k: 5,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Run one subject end to end and record the decision.
    pub fn process_subject(
        &self,
        subject_id: &str,
        as_of: NaiveDate,
        market_context: Option<&str>,
    ) -> Result<SubjectResult> {
        let id = correlation_id(subject_id, as_of);
        if self.memory.get_decision(&id)?.is_some() {
            return Ok(SubjectResult::AlreadyRecorded { correlation_id: id });
        }

        let revision = self.machine.run(subject_id, self.drafter, self.critic)?;
        let similar = self
            .memory
            .find_similar(self.gateway, &revision.draft_text, self.top_k)?;
        let similar_cases = similar.cases().map_or(0, <[_]>::len);

        let synthesis = self
            .synthesizer
            .synthesize(subject_id, &revision, &similar, market_context)
            .map_err(|e| EngineError::collaborator(Stage::Synthesize, e))?;

        let decision = Decision::new(subject_id, as_of, synthesis.verdict, synthesis.rationale);
        let vector = self
            .gateway
            .embed(&decision.rationale_text)
            .map_err(|e| EngineError::collaborator(Stage::Embed, e))?;
        let embedding = Embedding {
            correlation_id: decision.correlation_id.clone(),
            vector,
        };

        match self.memory.record(&decision, &embedding)? {
            RecordStatus::Recorded { .. } => Ok(SubjectResult::Recorded {
                decision,
                revision,
                similar_cases,
            }),
            RecordStatus::AlreadyRecorded => Ok(SubjectResult::AlreadyRecorded {
                correlation_id: decision.correlation_id,
            }),
        }
    }

    /// Process subjects sequentially.
    pub fn run(
        &self,
        subjects: &[String],
        as_of: NaiveDate,
        market_context: Option<&str>,
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        for subject in subjects {
            match self.process_subject(subject, as_of, market_context) {
                Ok(SubjectResult::Recorded { decision, .. }) => report.recorded.push(decision),
                Ok(SubjectResult::AlreadyRecorded { correlation_id }) => {
                    report.already_recorded.push(correlation_id)
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(subject = %subject, error = %e, "subject skipped");
                    report.skipped.push((subject.clone(), e.to_string()));
                }
            }
        }

        info!(
            %as_of,
            recorded = report.recorded.len(),
            already = report.already_recorded.len(),
            skipped = report.skipped.len(),
            "batch finished"
        );
        Ok(report)
    }
}

/// Print a batch report in a human-readable format
pub fn print_batch_report(report: &BatchReport) {
    println!("\nBATCH");
    for d in &report.recorded {
        let verdict = if d.verdict { "INCLUDE" } else { "REJECT" };
        println!("   {:<8} {}", verdict, d.correlation_id);
    }
    for id in &report.already_recorded {
        println!("   {:<8} {}", "EXISTS", id);
    }
    for (subject, err) in &report.skipped {
        println!("   {:<8} {} ({})", "SKIPPED", subject, err);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedder;
    use crate::memory::RetrievalPolicy;
    use crate::revision::{Critique, CritiqueReply};
    use std::cell::Cell;
    use tempfile::tempdir;

    const DIM: usize = 32;

    /// Fails for subjects starting with "BAD"
    #[derive(Default)]
    struct FakeDrafter {
        calls: Cell<usize>,
    }

    impl Drafter for FakeDrafter {
        fn draft(&self, subject_id: &str, feedback: Option<&str>) -> anyhow::Result<String> {
            self.calls.set(self.calls.get() + 1);
            if subject_id.starts_with("BAD") {
                anyhow::bail!("no data for {}", subject_id);
            }
            Ok(format!("report on {} revised={}", subject_id, feedback.is_some()))
        }
    }

    struct AcceptSecond;

    impl Critic for AcceptSecond {
        fn critique(&self, draft: &str) -> anyhow::Result<CritiqueReply> {
            let accept = draft.ends_with("revised=true");
            Ok(CritiqueReply::Parsed(Critique::new("tighten it", !accept, accept)))
        }
    }

    /// Includes whatever the critic accepted
    struct FollowCritic;

    impl DecisionSynthesizer for FollowCritic {
        fn synthesize(
            &self,
            subject_id: &str,
            outcome: &RevisionOutcome,
            _similar: &Retrieval,
            market_context: Option<&str>,
        ) -> anyhow::Result<Synthesis> {
            Ok(Synthesis {
                verdict: outcome.accepted,
                rationale: format!(
                    "{} decided in context {}",
                    subject_id,
                    market_context.unwrap_or("none")
                ),
            })
        }
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 28).unwrap()
    }

    fn subjects(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_batch_records_and_skips() {
        let dir = tempdir().unwrap();
        let memory =
            CaseMemory::open(&dir.path().join("cases.db"), DIM, RetrievalPolicy::default()).unwrap();
        let gateway = HashEmbedder::new(DIM);
        let drafter = FakeDrafter::default();
        let pipeline = DecisionPipeline::new(
            RevisionMachine::new(2).unwrap(),
            &memory,
            &gateway,
            &drafter,
            &AcceptSecond,
            &FollowCritic,
        );

        let report = pipeline
            .run(&subjects(&["005930", "BAD1", "000660"]), as_of(), Some("flat"))
            .unwrap();
        assert_eq!(report.recorded.len(), 2);
        assert!(report.recorded.iter().all(|d| d.verdict));
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "BAD1");
        assert!(report.skipped[0].1.contains("draft"));
        assert_eq!(memory.population(), 2);
        assert!(memory
            .get_decision("BAD1@2025-03-28")
            .unwrap()
            .is_none());

        let stored = memory.get_decision("005930@2025-03-28").unwrap().unwrap();
        assert!(stored.rationale_text.contains("context flat"));
    }

    #[test]
    fn test_rerun_does_not_call_collaborators() {
        let dir = tempdir().unwrap();
        let memory =
            CaseMemory::open(&dir.path().join("cases.db"), DIM, RetrievalPolicy::default()).unwrap();
        let gateway = HashEmbedder::new(DIM);
        let drafter = FakeDrafter::default();
        let pipeline = DecisionPipeline::new(
            RevisionMachine::new(2).unwrap(),
            &memory,
            &gateway,
            &drafter,
            &AcceptSecond,
            &FollowCritic,
        );

        pipeline.run(&subjects(&["A"]), as_of(), None).unwrap();
        let calls = drafter.calls.get();

        let again = pipeline.run(&subjects(&["A"]), as_of(), None).unwrap();
        assert!(again.recorded.is_empty());
        assert_eq!(again.already_recorded, vec!["A@2025-03-28".to_string()]);
        assert_eq!(drafter.calls.get(), calls);
    }

    #[test]
    fn test_fatal_error_stops_batch() {
        let dir = tempdir().unwrap();
        let memory =
            CaseMemory::open(&dir.path().join("cases.db"), DIM, RetrievalPolicy::default()).unwrap();
        // Gateway dimension disagrees with the index
        let gateway = HashEmbedder::new(DIM * 2);
        let drafter = FakeDrafter::default();
        let pipeline = DecisionPipeline::new(
            RevisionMachine::new(1).unwrap(),
            &memory,
            &gateway,
            &drafter,
            &AcceptSecond,
            &FollowCritic,
        );

        let err = pipeline
            .run(&subjects(&["A", "B"]), as_of(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
        assert_eq!(memory.population(), 0);
    }

    #[test]
    fn test_synthesis_from_json() {
        let s = Synthesis::from_json("```json\n{\"verdict\": false, \"rationale\": \"too risky\"}\n```")
            .unwrap();
        assert!(!s.verdict);
        assert_eq!(s.rationale, "too risky");
        assert!(Synthesis::from_json(r#"{"verdict": "buy", "rationale": "x"}"#).is_err());
    }

    #[test]
    fn test_synthesis_accepts_same_fences_as_critique() {
        for raw in [
            "```\n{\"verdict\": true, \"rationale\": \"ok\"}\n```",
            "```JSON\n{\"verdict\": true, \"rationale\": \"ok\"}```",
            "  {\"verdict\": true, \"rationale\": \"ok\"}  ",
        ] {
            let s = Synthesis::from_json(raw).unwrap();
            assert!(s.verdict, "{raw}");
            assert_eq!(s.rationale, "ok");
        }
    }
}

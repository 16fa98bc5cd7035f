//! Bounded draft → critique → revise loop
//!
//! One [`RevisionState`] lives for one subject's run. It is only mutated by
//! [`RevisionState::apply_draft`] and [`RevisionState::apply_critique`]; the
//! machine stops at `Accepted` or `Exhausted` after at most `max_iterations`
//! critiques, and both terminal phases hand back the last draft.

use crate::error::{EngineError, ParseError, Result, Stage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Drafting,
    Critiquing,
    Accepted,
    Exhausted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Accepted | Phase::Exhausted)
    }
}

/// A validated critique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critique {
    /// Review text, fed back to the drafter when `revise` is set
    #[serde(alias = "critic")]
    pub text: String,
    pub revise: bool,
    pub accept: bool,
}

impl Critique {
    pub fn new(text: impl Into<String>, revise: bool, accept: bool) -> Self {
        Self {
            text: text.into(),
            revise,
            accept,
        }
    }

    /// Validate a structured critic reply.
    ///
    /// Every field is required; a missing or mistyped field is a
    /// [`ParseError`], never a silent `false`.
    pub fn from_json(raw: &str) -> std::result::Result<Self, ParseError> {
        let trimmed = strip_code_fence(raw);
        serde_json::from_str(trimmed).map_err(|e| ParseError::new("critique", e.to_string()))
    }
}

/// Body of a Markdown code fence (```` ``` ```` or ```` ```json ````), or the
/// trimmed input when it is not fenced.
pub(crate) fn strip_code_fence(raw: &str) -> &str {
    let s = raw.trim();
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// What a critic returned: a valid critique, or a reply that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub enum CritiqueReply {
    Parsed(Critique),
    Unparseable(ParseError),
}

impl CritiqueReply {
    pub fn from_json(raw: &str) -> Self {
        match Critique::from_json(raw) {
            Ok(c) => CritiqueReply::Parsed(c),
            Err(e) => CritiqueReply::Unparseable(e),
        }
    }
}

/// Produces a draft for a subject, optionally revising against feedback.
pub trait Drafter {
    fn draft(&self, subject_id: &str, feedback: Option<&str>) -> anyhow::Result<String>;
}

/// Reviews a draft.
pub trait Critic {
    fn critique(&self, draft: &str) -> anyhow::Result<CritiqueReply>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RevisionState {
    pub subject_id: String,
    pub phase: Phase,
    pub draft_text: String,
    pub critique_text: Option<String>,
    pub feedback_text: Option<String>,
    pub accepted: bool,
    pub iteration: u32,
    pub max_iterations: u32,
}

impl RevisionState {
    pub fn new(subject_id: &str, max_iterations: u32) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            phase: Phase::Drafting,
            draft_text: String::new(),
            critique_text: None,
            feedback_text: None,
            accepted: false,
            iteration: 0,
            max_iterations,
        }
    }

    /// Drafting → Critiquing
    pub fn apply_draft(&mut self, draft: String) {
        debug_assert_eq!(self.phase, Phase::Drafting);
        self.draft_text = draft;
        self.phase = Phase::Critiquing;
    }

    /// Critiquing → Accepted | Exhausted | Drafting
    pub fn apply_critique(&mut self, critique: Critique) {
        debug_assert_eq!(self.phase, Phase::Critiquing);
        self.iteration += 1;
        self.accepted = critique.accept;

        self.phase = if critique.accept {
            self.feedback_text = None;
            Phase::Accepted
        } else if self.iteration >= self.max_iterations {
            Phase::Exhausted
        } else if critique.revise {
            self.feedback_text = Some(critique.text.clone());
            Phase::Drafting
        } else {
            self.feedback_text = None;
            Phase::Drafting
        };
        self.critique_text = Some(critique.text);

        debug!(
            subject = %self.subject_id,
            iteration = self.iteration,
            phase = ?self.phase,
            "critique applied"
        );
    }
}

/// Terminal result of one subject's run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevisionOutcome {
    pub subject_id: String,
    pub draft_text: String,
    pub critique_text: Option<String>,
    pub accepted: bool,
    pub iterations: u32,
    pub phase: Phase,
}

impl From<RevisionState> for RevisionOutcome {
    fn from(state: RevisionState) -> Self {
        Self {
            subject_id: state.subject_id,
            draft_text: state.draft_text,
            critique_text: state.critique_text,
            accepted: state.accepted,
            iterations: state.iteration,
            phase: state.phase,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RevisionMachine {
    max_iterations: u32,
}

impl RevisionMachine {
    pub fn new(max_iterations: u32) -> Result<Self> {
        if max_iterations == 0 {
            return Err(EngineError::Config(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(Self { max_iterations })
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Drive one subject to a terminal phase.
    ///
    /// Drafter and critic errors abort the run as
    /// [`EngineError::Collaborator`]; nothing is retried here.
    pub fn run(
        &self,
        subject_id: &str,
        drafter: &dyn Drafter,
        critic: &dyn Critic,
    ) -> Result<RevisionOutcome> {
        let mut state = RevisionState::new(subject_id, self.max_iterations);

        while !state.phase.is_terminal() {
            let draft = drafter
                .draft(subject_id, state.feedback_text.as_deref())
                .map_err(|e| EngineError::collaborator(Stage::Draft, e))?;
            state.apply_draft(draft);

            let reply = critic
                .critique(&state.draft_text)
                .map_err(|e| EngineError::collaborator(Stage::Critique, e))?;

            let critique = match reply {
                CritiqueReply::Parsed(c) => c,
                CritiqueReply::Unparseable(err) => {
                    warn!(
                        subject = subject_id,
                        iteration = state.iteration + 1,
                        error = %err,
                        "unparseable critique, treating as no-accept no-revise"
                    );
                    Critique::new(String::new(), false, false)
                }
            };
            state.apply_critique(critique);
        }

        info!(
            subject = subject_id,
            iterations = state.iteration,
            accepted = state.accepted,
            phase = ?state.phase,
            "revision finished"
        );
        Ok(state.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Returns "draft N" and records the feedback it was given.
    #[derive(Default)]
    struct CountingDrafter {
        calls: RefCell<Vec<Option<String>>>,
    }

    impl Drafter for CountingDrafter {
        fn draft(&self, _subject_id: &str, feedback: Option<&str>) -> anyhow::Result<String> {
            let mut calls = self.calls.borrow_mut();
            calls.push(feedback.map(str::to_string));
            Ok(format!("draft {}", calls.len()))
        }
    }

    /// Replays scripted replies, repeating the last one forever.
    struct ScriptedCritic {
        replies: Vec<CritiqueReply>,
        calls: RefCell<usize>,
    }

    impl ScriptedCritic {
        fn new(replies: Vec<CritiqueReply>) -> Self {
            Self {
                replies,
                calls: RefCell::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.borrow()
        }
    }

    impl Critic for ScriptedCritic {
        fn critique(&self, _draft: &str) -> anyhow::Result<CritiqueReply> {
            let mut calls = self.calls.borrow_mut();
            let reply = self.replies[(*calls).min(self.replies.len() - 1)].clone();
            *calls += 1;
            Ok(reply)
        }
    }

    fn revise(text: &str) -> CritiqueReply {
        CritiqueReply::Parsed(Critique::new(text, true, false))
    }

    fn accept() -> CritiqueReply {
        CritiqueReply::Parsed(Critique::new("looks good", false, true))
    }

    #[test]
    fn test_zero_budget_is_config_error() {
        assert!(matches!(
            RevisionMachine::new(0),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_always_revise_exhausts_after_budget() {
        let drafter = CountingDrafter::default();
        let critic = ScriptedCritic::new(vec![revise("add margin analysis")]);
        let outcome = RevisionMachine::new(2)
            .unwrap()
            .run("005930", &drafter, &critic)
            .unwrap();

        assert_eq!(outcome.phase, Phase::Exhausted);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.draft_text, "draft 2");
        assert!(!outcome.accepted);
        assert_eq!(critic.calls(), 2);

        // Second draft saw the first critique
        let calls = drafter.calls.borrow();
        assert_eq!(calls[0], None);
        assert_eq!(calls[1].as_deref(), Some("add margin analysis"));
    }

    #[test]
    fn test_accept_on_first_critique() {
        let drafter = CountingDrafter::default();
        let critic = ScriptedCritic::new(vec![accept()]);
        let outcome = RevisionMachine::new(3)
            .unwrap()
            .run("000660", &drafter, &critic)
            .unwrap();

        assert_eq!(outcome.phase, Phase::Accepted);
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.accepted);
        assert_eq!(outcome.draft_text, "draft 1");
        assert_eq!(outcome.critique_text.as_deref(), Some("looks good"));
    }

    #[test]
    fn test_accept_on_last_allowed_critique_wins() {
        let drafter = CountingDrafter::default();
        let critic = ScriptedCritic::new(vec![revise("more"), accept()]);
        let outcome = RevisionMachine::new(2)
            .unwrap()
            .run("A", &drafter, &critic)
            .unwrap();
        assert_eq!(outcome.phase, Phase::Accepted);
        assert_eq!(outcome.iterations, 2);
    }

    #[test]
    fn test_terminates_within_budget_for_any_critic() {
        let scripts = vec![
            vec![revise("x")],
            vec![CritiqueReply::Parsed(Critique::new("meh", false, false))],
            vec![CritiqueReply::Unparseable(ParseError::new("critique", "eof"))],
            vec![revise("a"), CritiqueReply::Parsed(Critique::new("b", false, false))],
        ];
        for max in 1..=5 {
            for script in &scripts {
                let drafter = CountingDrafter::default();
                let critic = ScriptedCritic::new(script.clone());
                let outcome = RevisionMachine::new(max)
                    .unwrap()
                    .run("S", &drafter, &critic)
                    .unwrap();
                assert!(critic.calls() <= max as usize);
                assert_eq!(outcome.iterations, max);
                assert_eq!(outcome.phase, Phase::Exhausted);
            }
        }
    }

    #[test]
    fn test_unparseable_reply_clears_feedback() {
        let drafter = CountingDrafter::default();
        let critic = ScriptedCritic::new(vec![
            revise("fix the table"),
            CritiqueReply::Unparseable(ParseError::new("critique", "missing field `accept`")),
            accept(),
        ]);
        let outcome = RevisionMachine::new(5)
            .unwrap()
            .run("S", &drafter, &critic)
            .unwrap();

        assert_eq!(outcome.iterations, 3);
        let calls = drafter.calls.borrow();
        assert_eq!(calls[1].as_deref(), Some("fix the table"));
        assert_eq!(calls[2], None);
    }

    #[test]
    fn test_drafter_error_aborts_run() {
        struct FailingDrafter;
        impl Drafter for FailingDrafter {
            fn draft(&self, _: &str, _: Option<&str>) -> anyhow::Result<String> {
                anyhow::bail!("model unavailable")
            }
        }
        let critic = ScriptedCritic::new(vec![accept()]);
        let err = RevisionMachine::new(2)
            .unwrap()
            .run("S", &FailingDrafter, &critic)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Collaborator { stage: Stage::Draft, .. }
        ));
        assert_eq!(critic.calls(), 0);
    }

    #[test]
    fn test_critic_error_aborts_run() {
        struct FailingCritic;
        impl Critic for FailingCritic {
            fn critique(&self, _: &str) -> anyhow::Result<CritiqueReply> {
                anyhow::bail!("rate limited")
            }
        }
        let err = RevisionMachine::new(2)
            .unwrap()
            .run("S", &CountingDrafter::default(), &FailingCritic)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Collaborator { stage: Stage::Critique, .. }
        ));
    }

    #[test]
    fn test_critique_from_json() {
        let c = Critique::from_json(r#"{"text": "ok", "revise": false, "accept": true}"#).unwrap();
        assert!(c.accept);

        let fenced = "```json\n{\"critic\": \"needs sources\", \"revise\": true, \"accept\": false}\n```";
        let c = Critique::from_json(fenced).unwrap();
        assert_eq!(c.text, "needs sources");
        assert!(c.revise);

        assert!(Critique::from_json(r#"{"text": "ok", "revise": false}"#).is_err());
        assert!(Critique::from_json(r#"{"text": "ok", "revise": "yes", "accept": true}"#).is_err());
        assert!(matches!(
            CritiqueReply::from_json("not json"),
            CritiqueReply::Unparseable(_)
        ));
    }

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```JSON {} ```"), "{}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("  {}\n"), "{}");
        // Unterminated fence still yields the body
        assert_eq!(strip_code_fence("```json\n{}"), "{}");
    }
}

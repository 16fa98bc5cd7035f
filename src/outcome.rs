//! Outcome tracking - THE FEEDBACK LOOP
//!
//! Decisions are graded after the fact: for every configured horizon the
//! realized return since the decision date is looked up, and once all of them
//! have resolved a single feedback record is written. Those records are what
//! case memory hands back alongside similar past decisions, and what the
//! accuracy report is computed from.

use crate::error::{EngineError, Result, Stage};
use crate::memory::CaseMemory;
use crate::types::{Decision, FeedbackRecord, FeedbackStatus, Horizon};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use statrs::distribution::{Beta, ContinuousCDF};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Source of realized returns.
pub trait MarketData {
    /// Percent return of `subject_id` over `horizon` starting at `start`, or
    /// `None` when the data does not cover the window yet.
    fn return_over_horizon(
        &self,
        subject_id: &str,
        start: NaiveDate,
        horizon: Horizon,
    ) -> anyhow::Result<Option<f64>>;
}

/// Writes the outcome summary stored with a feedback record.
pub trait OutcomeSummarizer {
    fn summarize(&self, decision_text: &str, returns: &BTreeMap<Horizon, f64>)
        -> anyhow::Result<String>;
}

/// Offline summarizer: lists the returns per horizon.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainSummarizer;

impl OutcomeSummarizer for PlainSummarizer {
    fn summarize(
        &self,
        _decision_text: &str,
        returns: &BTreeMap<Horizon, f64>,
    ) -> anyhow::Result<String> {
        let parts: Vec<String> = returns
            .iter()
            .map(|(h, pct)| format!("{}: {:+.2}%", h, pct))
            .collect();
        Ok(format!("Realized returns {}", parts.join(", ")))
    }
}

pub struct OutcomeTracker<'a> {
    memory: &'a CaseMemory,
    market: &'a dyn MarketData,
    summarizer: &'a dyn OutcomeSummarizer,
    horizons: Vec<Horizon>,
    today: NaiveDate,
}

impl<'a> OutcomeTracker<'a> {
    pub fn new(
        memory: &'a CaseMemory,
        market: &'a dyn MarketData,
        summarizer: &'a dyn OutcomeSummarizer,
        horizons: &[Horizon],
    ) -> Result<Self> {
        let horizons = normalize_horizons(horizons)?;
        Ok(Self {
            memory,
            market,
            summarizer,
            horizons,
            today: Utc::now().date_naive(),
        })
    }

    /// Override the current date (windows ending after it count as unresolved)
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn horizons(&self) -> &[Horizon] {
        &self.horizons
    }

    /// Grade one decision over `horizons`.
    ///
    /// Writes a record only when every horizon resolved. Calling again after a
    /// record exists returns the stored record without touching market data.
    pub fn compute_feedback(
        &self,
        correlation_id: &str,
        subject_id: &str,
        decision_text: &str,
        as_of: NaiveDate,
        horizons: &[Horizon],
    ) -> Result<FeedbackStatus> {
        if let Some(existing) = self.memory.get_feedback(correlation_id)? {
            debug!(correlation_id, "feedback already recorded");
            return Ok(FeedbackStatus::AlreadyRecorded(existing));
        }
        if self.memory.get_decision(correlation_id)?.is_none() {
            return Err(EngineError::InvalidRecord(format!(
                "no decision recorded for {}",
                correlation_id
            )));
        }

        let horizons = normalize_horizons(horizons)?;
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();

        for horizon in horizons {
            match self.resolve(subject_id, as_of, horizon)? {
                Some(pct) => {
                    resolved.insert(horizon, pct);
                }
                None => missing.push(horizon),
            }
        }

        if !missing.is_empty() {
            debug!(
                correlation_id,
                missing = ?missing.iter().map(Horizon::label).collect::<Vec<_>>(),
                "feedback pending"
            );
            return Ok(FeedbackStatus::Pending { resolved, missing });
        }

        let summary_text = self
            .summarizer
            .summarize(decision_text, &resolved)
            .map_err(|e| EngineError::collaborator(Stage::Summarize, e))?;

        let record = FeedbackRecord {
            correlation_id: correlation_id.to_string(),
            returns: resolved,
            summary_text,
            created_at: Utc::now(),
        };
        let status = self.memory.store_feedback(&record)?;
        if matches!(status, FeedbackStatus::Recorded(_)) {
            info!(correlation_id, horizons = record.returns.len(), "feedback recorded");
        }
        Ok(status)
    }

    /// [`OutcomeTracker::compute_feedback`] for a ledger decision with the
    /// tracker's configured horizons.
    pub fn compute_for(&self, decision: &Decision) -> Result<FeedbackStatus> {
        self.compute_feedback(
            &decision.correlation_id,
            &decision.subject_id,
            &decision.rationale_text,
            decision.as_of,
            &self.horizons,
        )
    }

    fn resolve(&self, subject_id: &str, as_of: NaiveDate, horizon: Horizon) -> Result<Option<f64>> {
        match horizon.window_end(as_of) {
            Some(end) if end <= self.today => self
                .market
                .return_over_horizon(subject_id, as_of, horizon)
                .map_err(|e| EngineError::collaborator(Stage::MarketData, e)),
            _ => Ok(None),
        }
    }

    /// Try to grade every decision that has no feedback yet.
    ///
    /// A collaborator failure skips that decision; fatal errors stop the sweep.
    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for decision in self.memory.pending_feedback()? {
            match self.compute_for(&decision) {
                Ok(FeedbackStatus::Recorded(_)) => report.written.push(decision.correlation_id),
                Ok(FeedbackStatus::AlreadyRecorded(_)) => {}
                Ok(FeedbackStatus::Pending { .. }) => report.pending.push(decision.correlation_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(correlation_id = %decision.correlation_id, error = %e, "feedback failed");
                    report.failed.push((decision.correlation_id, e.to_string()));
                }
            }
        }

        info!(
            written = report.written.len(),
            pending = report.pending.len(),
            failed = report.failed.len(),
            "feedback sweep finished"
        );
        Ok(report)
    }

    /// Hit rate and returns per horizon over all graded decisions.
    pub fn accuracy_report(&self) -> Result<AccuracyReport> {
        let graded = self.memory.graded_decisions()?;
        let horizons = self
            .horizons
            .iter()
            .map(|&h| horizon_accuracy(h, &graded))
            .collect();

        Ok(AccuracyReport {
            total_decisions: self.memory.population(),
            graded_decisions: graded.len(),
            horizons,
        })
    }
}

fn normalize_horizons(horizons: &[Horizon]) -> Result<Vec<Horizon>> {
    if horizons.is_empty() {
        return Err(EngineError::Config("at least one horizon is required".into()));
    }
    let mut sorted = horizons.to_vec();
    sorted.sort();
    sorted.dedup();
    Ok(sorted)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub written: Vec<String>,
    pub pending: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HorizonAccuracy {
    pub horizon: Horizon,
    pub graded: usize,
    /// Approved and went up, or rejected and did not
    pub hits: usize,
    pub hit_rate: f64,
    /// 95% credible interval on the hit rate (Beta posterior, uniform prior)
    pub credible_interval: (f64, f64),
    pub mean_return_approved: Option<f64>,
    pub mean_return_rejected: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub total_decisions: usize,
    pub graded_decisions: usize,
    pub horizons: Vec<HorizonAccuracy>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn credible_interval(hits: usize, misses: usize) -> (f64, f64) {
    match Beta::new(hits as f64 + 1.0, misses as f64 + 1.0) {
        Ok(beta) => (beta.inverse_cdf(0.025), beta.inverse_cdf(0.975)),
        Err(_) => (0.0, 1.0),
    }
}

fn horizon_accuracy(horizon: Horizon, graded: &[(Decision, FeedbackRecord)]) -> HorizonAccuracy {
    let mut hits = 0;
    let mut approved = Vec::new();
    let mut rejected = Vec::new();

    for (decision, feedback) in graded {
        let Some(&pct) = feedback.returns.get(&horizon) else {
            continue;
        };
        if decision.verdict {
            approved.push(pct);
            if pct > 0.0 {
                hits += 1;
            }
        } else {
            rejected.push(pct);
            if pct <= 0.0 {
                hits += 1;
            }
        }
    }

    let count = approved.len() + rejected.len();
    HorizonAccuracy {
        horizon,
        graded: count,
        hits,
        hit_rate: if count == 0 { 0.0 } else { hits as f64 / count as f64 },
        credible_interval: credible_interval(hits, count - hits),
        mean_return_approved: mean(&approved),
        mean_return_rejected: mean(&rejected),
    }
}

/// Print the accuracy report in a human-readable format
pub fn print_accuracy_report(report: &AccuracyReport) {
    println!("\nDECISION ACCURACY");
    println!(
        "   Graded: {} of {} decisions\n",
        report.graded_decisions, report.total_decisions
    );

    if report.graded_decisions == 0 {
        println!("   No feedback recorded yet. Run --feedback-sweep once horizons have passed.");
        println!();
        return;
    }

    let fmt_mean = |m: Option<f64>| m.map_or_else(|| "-".to_string(), |v| format!("{:+.2}%", v));
    for h in &report.horizons {
        println!(
            "   {:>4}  hit rate {:5.1}% ({}/{})  95% CI [{:.2}, {:.2}]  approved {}  rejected {}",
            h.horizon.label(),
            h.hit_rate * 100.0,
            h.hits,
            h.graded,
            h.credible_interval.0,
            h.credible_interval.1,
            fmt_mean(h.mean_return_approved),
            fmt_mean(h.mean_return_rejected),
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RetrievalPolicy;
    use crate::types::Embedding;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use tempfile::tempdir;

    const DIM: usize = 4;

    /// Returns whatever is in `returns` for a horizon; counts lookups.
    #[derive(Default)]
    struct FakeMarket {
        returns: RefCell<HashMap<Horizon, f64>>,
        lookups: Cell<usize>,
        fail: Cell<bool>,
    }

    impl FakeMarket {
        fn set(&self, horizon: Horizon, pct: f64) {
            self.returns.borrow_mut().insert(horizon, pct);
        }
    }

    impl MarketData for FakeMarket {
        fn return_over_horizon(
            &self,
            _subject_id: &str,
            _start: NaiveDate,
            horizon: Horizon,
        ) -> anyhow::Result<Option<f64>> {
            self.lookups.set(self.lookups.get() + 1);
            if self.fail.get() {
                anyhow::bail!("quote service down");
            }
            Ok(self.returns.borrow().get(&horizon).copied())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup() -> (CaseMemory, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let memory =
            CaseMemory::open(&dir.path().join("cases.db"), DIM, RetrievalPolicy::default()).unwrap();
        (memory, dir)
    }

    fn record(memory: &CaseMemory, subject: &str, as_of: NaiveDate, verdict: bool) -> Decision {
        let decision = Decision::new(subject, as_of, verdict, format!("{} call", subject));
        let embedding = Embedding {
            correlation_id: decision.correlation_id.clone(),
            vector: vec![0.5; DIM],
        };
        memory.record(&decision, &embedding).unwrap();
        decision
    }

    const WEEK_MONTH: [Horizon; 2] = [Horizon::ONE_WEEK, Horizon::ONE_MONTH];

    #[test]
    fn test_missing_horizon_writes_nothing_then_exactly_once() {
        let (memory, _dir) = setup();
        let market = FakeMarket::default();
        let tracker = OutcomeTracker::new(&memory, &market, &PlainSummarizer, &WEEK_MONTH)
            .unwrap()
            .with_today(date(2025, 12, 31));
        let d = record(&memory, "005930", date(2025, 3, 3), true);

        market.set(Horizon::ONE_WEEK, 2.0);
        let status = tracker.compute_for(&d).unwrap();
        match status {
            FeedbackStatus::Pending { resolved, missing } => {
                assert_eq!(resolved.get(&Horizon::ONE_WEEK), Some(&2.0));
                assert_eq!(missing, vec![Horizon::ONE_MONTH]);
            }
            other => panic!("expected pending, got {:?}", other),
        }
        assert!(memory.get_feedback(&d.correlation_id).unwrap().is_none());

        market.set(Horizon::ONE_MONTH, -1.5);
        let first = tracker.compute_for(&d).unwrap();
        let FeedbackStatus::Recorded(written) = first else {
            panic!("expected a record");
        };
        assert_eq!(written.returns.len(), 2);
        assert!(written.summary_text.contains("1m: -1.50%"));

        // Third call is a no-op returning the stored record
        let lookups = market.lookups.get();
        let again = tracker.compute_for(&d).unwrap();
        assert_eq!(again, FeedbackStatus::AlreadyRecorded(written));
        assert_eq!(market.lookups.get(), lookups);
        assert_eq!(memory.stats().unwrap().with_feedback, 1);
    }

    #[test]
    fn test_future_window_is_not_looked_up() {
        let (memory, _dir) = setup();
        let market = FakeMarket::default();
        market.set(Horizon::ONE_WEEK, 1.0);
        market.set(Horizon::ONE_MONTH, 1.0);
        let tracker = OutcomeTracker::new(&memory, &market, &PlainSummarizer, &WEEK_MONTH)
            .unwrap()
            .with_today(date(2025, 3, 15));
        let d = record(&memory, "A", date(2025, 3, 3), true);

        let status = tracker.compute_for(&d).unwrap();
        assert!(matches!(
            status,
            FeedbackStatus::Pending { ref missing, .. } if missing == &vec![Horizon::ONE_MONTH]
        ));
        assert_eq!(market.lookups.get(), 1);
    }

    #[test]
    fn test_market_error_is_collaborator_error() {
        let (memory, _dir) = setup();
        let market = FakeMarket::default();
        market.fail.set(true);
        let tracker = OutcomeTracker::new(&memory, &market, &PlainSummarizer, &WEEK_MONTH)
            .unwrap()
            .with_today(date(2026, 1, 1));
        let d = record(&memory, "A", date(2025, 3, 3), true);

        let err = tracker.compute_for(&d).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Collaborator { stage: Stage::MarketData, .. }
        ));
        assert!(memory.get_feedback(&d.correlation_id).unwrap().is_none());
    }

    #[test]
    fn test_empty_horizons_rejected() {
        let (memory, _dir) = setup();
        let market = FakeMarket::default();
        assert!(matches!(
            OutcomeTracker::new(&memory, &market, &PlainSummarizer, &[]),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_sweep_and_accuracy() {
        let (memory, _dir) = setup();
        let market = FakeMarket::default();
        market.set(Horizon::ONE_WEEK, 3.0);
        let tracker = OutcomeTracker::new(&memory, &market, &PlainSummarizer, &[Horizon::ONE_WEEK])
            .unwrap()
            .with_today(date(2025, 3, 20));

        record(&memory, "UP", date(2025, 3, 3), true);
        record(&memory, "MISS", date(2025, 3, 4), false);
        record(&memory, "LATE", date(2025, 3, 18), true);

        let report = tracker.sweep().unwrap();
        assert_eq!(report.written.len(), 2);
        assert_eq!(report.pending, vec!["LATE@2025-03-18".to_string()]);
        assert!(report.failed.is_empty());

        // Swept decisions are not revisited
        let again = tracker.sweep().unwrap();
        assert!(again.written.is_empty());
        assert_eq!(again.pending.len(), 1);

        let accuracy = tracker.accuracy_report().unwrap();
        assert_eq!(accuracy.total_decisions, 3);
        assert_eq!(accuracy.graded_decisions, 2);
        let week = &accuracy.horizons[0];
        assert_eq!(week.graded, 2);
        // Approved and up is a hit; rejected and up is a miss
        assert_eq!(week.hits, 1);
        assert!((week.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(week.mean_return_approved, Some(3.0));
        assert_eq!(week.mean_return_rejected, Some(3.0));
        let (lo, hi) = week.credible_interval;
        assert!(lo > 0.0 && lo < 0.5 && hi > 0.5 && hi < 1.0);
    }

    struct CountingSummarizer {
        calls: Cell<usize>,
    }

    impl OutcomeSummarizer for CountingSummarizer {
        fn summarize(
            &self,
            decision_text: &str,
            returns: &BTreeMap<Horizon, f64>,
        ) -> anyhow::Result<String> {
            self.calls.set(self.calls.get() + 1);
            PlainSummarizer.summarize(decision_text, returns)
        }
    }

    #[test]
    fn test_unknown_decision_is_rejected_before_any_lookup() {
        let (memory, _dir) = setup();
        let market = FakeMarket::default();
        market.set(Horizon::ONE_WEEK, 2.0);
        market.set(Horizon::ONE_MONTH, 3.0);
        let summarizer = CountingSummarizer { calls: Cell::new(0) };
        let tracker = OutcomeTracker::new(&memory, &market, &summarizer, &WEEK_MONTH)
            .unwrap()
            .with_today(date(2025, 12, 31));

        let err = tracker
            .compute_feedback("000660@2025-03-03", "000660", "buy", date(2025, 3, 3), &WEEK_MONTH)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRecord(_)));
        assert_eq!(market.lookups.get(), 0);
        assert_eq!(summarizer.calls.get(), 0);
        assert!(memory.get_feedback("000660@2025-03-03").unwrap().is_none());

        // Once the decision exists the same call goes through
        record(&memory, "000660", date(2025, 3, 3), true);
        let status = tracker
            .compute_feedback("000660@2025-03-03", "000660", "buy", date(2025, 3, 3), &WEEK_MONTH)
            .unwrap();
        assert!(matches!(status, FeedbackStatus::Recorded(_)));
        assert_eq!(summarizer.calls.get(), 1);
    }
}

//! OpenAI-compatible chat client and the collaborator adapters built on it
//!
//! Every engine collaborator that needs text generation (drafter, critic,
//! decision synthesizer, outcome summarizer) goes through [`ChatClient`].
//! Structured replies are requested with a JSON schema and validated with
//! serde; nothing is inferred from keywords in free text.

use crate::outcome::OutcomeSummarizer;
use crate::pipeline::{DecisionSynthesizer, Synthesis};
use crate::revision::{Critic, CritiqueReply, Drafter, RevisionOutcome};
use crate::types::{Horizon, Retrieval};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for the chat endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// API base URL; `/chat/completions` is appended
    pub api_url: String,

    /// API key (from environment)
    #[serde(skip_serializing)]
    pub api_key: String,

    pub model: String,

    pub temperature: f32,

    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.upstage.ai/v1".to_string(),
            api_key: std::env::var("CASEBOOK_LLM_API_KEY").unwrap_or_default(),
            model: "solar-pro".to_string(),
            temperature: 0.2,
            timeout_secs: 120,
        }
    }
}

pub struct ChatClient {
    config: LlmConfig,
    http: reqwest::blocking::Client,
}

impl ChatClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            anyhow::bail!("CASEBOOK_LLM_API_KEY not set. Chat collaborators require API access.");
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Free-text completion
    pub fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": messages(system, user),
        });
        self.send(&body)
    }

    /// Completion constrained to a JSON schema; returns the raw JSON text
    pub fn complete_json(
        &self,
        system: &str,
        user: &str,
        schema_name: &str,
        schema: serde_json::Value,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "temperature": self.config.temperature,
            "messages": messages(system, user),
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": schema_name,
                    "strict": true,
                    "schema": schema,
                }
            }
        });
        self.send(&body)
    }

    fn send(&self, body: &serde_json::Value) -> Result<String> {
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .with_context(|| format!("POST {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().unwrap_or_default();
            anyhow::bail!("API error {}: {}", status, error_text);
        }

        let json: serde_json::Value = response.json()?;
        let content = extract_content(&json)?;
        debug!(model = %self.config.model, chars = content.len(), "chat completion");
        Ok(content)
    }
}

fn messages(system: &str, user: &str) -> serde_json::Value {
    serde_json::json!([
        { "role": "system", "content": system },
        { "role": "user", "content": user },
    ])
}

fn extract_content(json: &serde_json::Value) -> Result<String> {
    json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .context("chat response has no choices[0].message.content")
}

// ============================================================================
// Drafter
// ============================================================================

const DRAFT_SYSTEM: &str = "You are an equity analyst. Write a concise investment report in \
markdown for the given subject: business overview, recent performance, key risks, and a \
clear include / reject view with reasons.";

pub struct LlmDrafter<'a> {
    client: &'a ChatClient,
    /// Extra facts appended to every prompt (prices, financials, sector notes)
    context: Option<String>,
}

impl<'a> LlmDrafter<'a> {
    pub fn new(client: &'a ChatClient) -> Self {
        Self {
            client,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

fn draft_prompt(subject_id: &str, context: Option<&str>, feedback: Option<&str>) -> String {
    let mut prompt = format!("Subject: {}\n", subject_id);
    if let Some(ctx) = context {
        prompt.push_str(&format!("\nContext:\n{}\n", ctx));
    }
    if let Some(fb) = feedback {
        prompt.push_str(&format!(
            "\nA reviewer asked for revisions. Address every point:\n{}\n",
            fb
        ));
    }
    prompt
}

impl Drafter for LlmDrafter<'_> {
    fn draft(&self, subject_id: &str, feedback: Option<&str>) -> Result<String> {
        let prompt = draft_prompt(subject_id, self.context.as_deref(), feedback);
        self.client.complete(DRAFT_SYSTEM, &prompt)
    }
}

// ============================================================================
// Critic
// ============================================================================

const CRITIC_SYSTEM: &str = "You review analyst reports. Point out errors, unsupported claims \
and missing analysis. Set revise=true if the report needs another draft. Set accept=true only \
if the report is ready as-is.";

pub struct LlmCritic<'a> {
    client: &'a ChatClient,
}

impl<'a> LlmCritic<'a> {
    pub fn new(client: &'a ChatClient) -> Self {
        Self { client }
    }
}

fn critique_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "text": { "type": "string", "description": "Review of the report" },
            "revise": { "type": "boolean", "description": "Another draft is needed" },
            "accept": { "type": "boolean", "description": "Report is final" }
        },
        "required": ["text", "revise", "accept"],
        "additionalProperties": false
    })
}

impl Critic for LlmCritic<'_> {
    fn critique(&self, draft: &str) -> Result<CritiqueReply> {
        let raw = self.client.complete_json(
            CRITIC_SYSTEM,
            &format!("Report to review:\n\n{}", draft),
            "critique",
            critique_schema(),
        )?;
        Ok(CritiqueReply::from_json(&raw))
    }
}

// ============================================================================
// Decision synthesizer
// ============================================================================

const SYNTH_SYSTEM: &str = "You are a fund manager. Combine the final analyst report, how \
similar past decisions turned out, and the market context into one decision. verdict=true \
means include the subject in the portfolio.";

pub struct LlmSynthesizer<'a> {
    client: &'a ChatClient,
}

impl<'a> LlmSynthesizer<'a> {
    pub fn new(client: &'a ChatClient) -> Self {
        Self { client }
    }
}

fn synthesis_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "verdict": { "type": "boolean" },
            "rationale": { "type": "string" }
        },
        "required": ["verdict", "rationale"],
        "additionalProperties": false
    })
}

/// Render retrieved cases for a prompt
pub fn render_cases(similar: &Retrieval) -> String {
    match similar {
        Retrieval::InsufficientData {
            population,
            required,
        } => format!(
            "No comparable history yet ({} of {} decisions recorded).",
            population, required
        ),
        Retrieval::Cases { cases } if cases.is_empty() => {
            "No sufficiently similar past decisions.".to_string()
        }
        Retrieval::Cases { cases } => {
            let mut out = String::new();
            for (i, case) in cases.iter().enumerate() {
                let verdict = if case.decision.verdict { "include" } else { "reject" };
                out.push_str(&format!(
                    "{}. {} on {} ({}, similarity {:.2})\n   {}\n",
                    i + 1,
                    case.decision.subject_id,
                    case.decision.as_of,
                    verdict,
                    case.similarity,
                    case.decision.rationale_text.lines().next().unwrap_or_default(),
                ));
                if let Some(fb) = &case.feedback {
                    out.push_str(&format!("   Outcome: {}\n", fb.summary_text));
                }
            }
            out
        }
    }
}

fn synthesis_prompt(
    subject_id: &str,
    outcome: &RevisionOutcome,
    similar: &Retrieval,
    market_context: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Subject: {}\n\nFinal report ({} after {} review round(s)):\n{}\n\nSimilar past decisions:\n{}\n",
        subject_id,
        if outcome.accepted { "accepted" } else { "not accepted" },
        outcome.iterations,
        outcome.draft_text,
        render_cases(similar),
    );
    if let Some(ctx) = market_context {
        prompt.push_str(&format!("\nMarket context:\n{}\n", ctx));
    }
    prompt
}

impl DecisionSynthesizer for LlmSynthesizer<'_> {
    fn synthesize(
        &self,
        subject_id: &str,
        outcome: &RevisionOutcome,
        similar: &Retrieval,
        market_context: Option<&str>,
    ) -> Result<Synthesis> {
        let raw = self.client.complete_json(
            SYNTH_SYSTEM,
            &synthesis_prompt(subject_id, outcome, similar, market_context),
            "decision",
            synthesis_schema(),
        )?;
        Ok(Synthesis::from_json(&raw)?)
    }
}

// ============================================================================
// Outcome summarizer
// ============================================================================

const SUMMARY_SYSTEM: &str = "Summarize in two sentences how an investment decision played out, \
given the decision text and the realized returns per horizon.";

pub struct LlmSummarizer<'a> {
    client: &'a ChatClient,
}

impl<'a> LlmSummarizer<'a> {
    pub fn new(client: &'a ChatClient) -> Self {
        Self { client }
    }
}

impl OutcomeSummarizer for LlmSummarizer<'_> {
    fn summarize(&self, decision_text: &str, returns: &BTreeMap<Horizon, f64>) -> Result<String> {
        let table: Vec<String> = returns
            .iter()
            .map(|(h, pct)| format!("{}: {:+.2}%", h, pct))
            .collect();
        self.client.complete(
            SUMMARY_SYSTEM,
            &format!("Decision:\n{}\n\nReturns:\n{}", decision_text, table.join("\n")),
        )
    }
}

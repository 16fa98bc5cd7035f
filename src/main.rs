//! casebook CLI
//!
//! Run with: cargo run -- --help

use anyhow::{bail, Context, Result};
use casebook::{
    llm::{ChatClient, LlmCritic, LlmDrafter, LlmSummarizer, LlmSynthesizer},
    market::PriceHistory,
    memory::print_memory_stats,
    outcome::{print_accuracy_report, PlainSummarizer},
    pipeline::print_batch_report,
    CaseMemory, DecisionPipeline, EmbeddingGateway, EngineConfig, OutcomeSummarizer,
    OutcomeTracker, Retrieval, RevisionMachine,
};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

const USAGE: &str = "\
casebook - critique loop and case memory for investment decisions

USAGE:
    casebook [--config <path>] <command>

COMMANDS:
    --run <YYYY-MM-DD> <subject>...     Draft, critique, decide and record each subject
        [--context <text>]              Market context passed to the decision step
    --similar <query>                   Show similar past decisions
    --feedback-sweep [--llm-summary]    Grade decisions whose horizons have passed
    --accuracy                          Hit rate and returns per horizon
    --stats                             Case memory statistics
    --import-prices <subject> <csv>     Load daily closes (date,close)
    --help
";

fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config").map(PathBuf::from);

    if args.is_empty() || args[0] == "--help" || args[0] == "-h" {
        print!("{}", USAGE);
        return Ok(());
    }

    tracing_subscriber::fmt::init();
    let config = EngineConfig::load(config_path.as_deref()).context("Failed to load config")?;

    match args[0].as_str() {
        "--run" => {
            let context = take_option(&mut args, "--context");
            let as_of = args
                .get(1)
                .context("Usage: --run <YYYY-MM-DD> <subject>...")?;
            let as_of = NaiveDate::parse_from_str(as_of, "%Y-%m-%d")
                .with_context(|| format!("Invalid date: {}", as_of))?;
            let subjects = &args[2..];
            if subjects.is_empty() {
                bail!("Usage: --run <YYYY-MM-DD> <subject>...");
            }
            run_batch(&config, as_of, subjects, context.as_deref())
        }
        "--similar" => {
            let query = args[1..].join(" ");
            if query.is_empty() {
                bail!("Usage: --similar <query>");
            }
            run_similar(&config, &query)
        }
        "--feedback-sweep" => {
            let llm_summary = args.iter().any(|a| a == "--llm-summary");
            run_feedback_sweep(&config, llm_summary)
        }
        "--accuracy" => run_accuracy(&config),
        "--stats" => run_stats(&config),
        "--import-prices" => {
            let (Some(subject), Some(csv)) = (args.get(1), args.get(2)) else {
                bail!("Usage: --import-prices <subject> <csv>");
            };
            run_import_prices(&config, subject, Path::new(csv))
        }
        other => {
            eprint!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

/// Remove `--flag <value>` from args and return the value
fn take_option(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    if pos + 1 >= args.len() {
        args.remove(pos);
        return None;
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Some(value)
}

fn open_memory(config: &EngineConfig) -> Result<(CaseMemory, Box<dyn EmbeddingGateway>)> {
    let gateway = config.build_gateway()?;
    let memory = CaseMemory::open(
        &config.cases_db_path(),
        gateway.dimension(),
        config.retrieval.clone(),
    )?;
    tracing::info!("Case memory at {:?}", memory.path());
    Ok((memory, gateway))
}

fn run_batch(
    config: &EngineConfig,
    as_of: NaiveDate,
    subjects: &[String],
    context: Option<&str>,
) -> Result<()> {
    let (memory, gateway) = open_memory(config)?;
    let client = ChatClient::new(config.llm.clone())?;
    let drafter = LlmDrafter::new(&client);
    let critic = LlmCritic::new(&client);
    let synthesizer = LlmSynthesizer::new(&client);

    let pipeline = DecisionPipeline::new(
        RevisionMachine::new(config.max_iterations)?,
        &memory,
        gateway.as_ref(),
        &drafter,
        &critic,
        &synthesizer,
    )
    .with_top_k(config.top_k);

    let report = pipeline.run(subjects, as_of, context)?;
    print_batch_report(&report);
    memory.close()?;
    Ok(())
}

fn run_similar(config: &EngineConfig, query: &str) -> Result<()> {
    let (memory, gateway) = open_memory(config)?;

    match memory.find_similar(gateway.as_ref(), query, config.top_k)? {
        Retrieval::InsufficientData {
            population,
            required,
        } => {
            println!(
                "Not enough history: {} of {} decisions recorded.",
                population, required
            );
        }
        Retrieval::Cases { cases } if cases.is_empty() => {
            println!("No similar decisions with recorded outcomes.");
        }
        Retrieval::Cases { cases } => {
            println!("\nSIMILAR DECISIONS\n");
            for (i, case) in cases.iter().enumerate() {
                let verdict = if case.decision.verdict { "INCLUDE" } else { "REJECT" };
                println!(
                    "{}. [{:.3}] {} {}",
                    i + 1,
                    case.similarity,
                    verdict,
                    case.decision.correlation_id
                );
                if let Some(fb) = &case.feedback {
                    println!("   {}", fb.summary_text);
                }
            }
            println!();
        }
    }
    Ok(())
}

fn run_feedback_sweep(config: &EngineConfig, llm_summary: bool) -> Result<()> {
    let (memory, _gateway) = open_memory(config)?;
    let prices = PriceHistory::open(&config.prices_db_path())?;

    let client = if llm_summary {
        Some(ChatClient::new(config.llm.clone())?)
    } else {
        None
    };
    let llm = client.as_ref().map(LlmSummarizer::new);
    let summarizer: &dyn OutcomeSummarizer = match &llm {
        Some(s) => s,
        None => &PlainSummarizer,
    };

    let tracker = OutcomeTracker::new(&memory, &prices, summarizer, &config.horizons)?;
    let report = tracker.sweep()?;

    println!(
        "\nFeedback written: {}, pending: {}, failed: {}",
        report.written.len(),
        report.pending.len(),
        report.failed.len()
    );
    for (id, err) in &report.failed {
        println!("   {} ({})", id, err);
    }
    Ok(())
}

fn run_accuracy(config: &EngineConfig) -> Result<()> {
    let (memory, _gateway) = open_memory(config)?;
    let prices = PriceHistory::open(&config.prices_db_path())?;
    let tracker = OutcomeTracker::new(&memory, &prices, &PlainSummarizer, &config.horizons)?;
    print_accuracy_report(&tracker.accuracy_report()?);
    Ok(())
}

fn run_stats(config: &EngineConfig) -> Result<()> {
    let (memory, _gateway) = open_memory(config)?;
    print_memory_stats(&memory.stats()?);
    Ok(())
}

fn run_import_prices(config: &EngineConfig, subject: &str, csv: &Path) -> Result<()> {
    let prices = PriceHistory::open(&config.prices_db_path())?;
    let n = prices
        .import_csv_file(subject, csv)
        .with_context(|| format!("Failed to import {}", csv.display()))?;
    println!("Imported {} closes for {}", n, subject);
    Ok(())
}

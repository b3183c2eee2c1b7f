//! Tick command - replay a scenario and evaluate one reconciliation tick.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;

use tidemark_core::AssetKey;
use tidemark_flow::queryer::QueryKind;
use tidemark_flow::reconcile::{AssetEvaluation, Decision, RunRequest};
use tidemark_flow::sensor::{AssetReconciliationSensor, TickResult};
use tidemark_flow::store::memory::InMemoryFactStore;

use crate::scenario::{RunLabels, Scenario};
use crate::{Config, OutputFormat};

/// Arguments for the tick command.
#[derive(Debug, Args)]
pub struct TickArgs {
    /// Scenario file (JSON).
    #[arg(long, short = 's')]
    pub scenario: PathBuf,

    /// Cursor from a previous tick.
    #[arg(long, conflicts_with = "cursor_file")]
    pub cursor: Option<String>,

    /// File holding the cursor from a previous tick. A missing file means
    /// no cursor.
    #[arg(long)]
    pub cursor_file: Option<PathBuf>,

    /// Write the new cursor back to `--cursor-file`.
    #[arg(long, requires = "cursor_file")]
    pub write_cursor: bool,
}

/// Execute the tick command.
///
/// # Errors
///
/// Returns an error if the scenario is invalid, the cursor cannot be read or
/// decoded, or the tick fails.
pub fn execute(args: &TickArgs, config: &Config) -> Result<()> {
    let scenario = Scenario::load(&args.scenario)?;

    let mut sensor_config = scenario.sensor.clone();
    sensor_config
        .apply_env()
        .context("invalid sensor configuration")?;
    let sensor = AssetReconciliationSensor::new(sensor_config)?;

    let graph = scenario.graph()?;
    let store = InMemoryFactStore::new();
    let labels = scenario.replay(&store)?;

    let cursor = match (&args.cursor, &args.cursor_file) {
        (Some(cursor), _) => Some(cursor.clone()),
        (None, Some(path)) => read_cursor(path)?,
        (None, None) => None,
    };

    let tick = sensor
        .evaluate_tick(&graph, &store, cursor.as_deref())
        .context("reconciliation tick failed")?;

    if args.write_cursor {
        if let Some(path) = &args.cursor_file {
            std::fs::write(path, &tick.cursor)
                .with_context(|| format!("failed to write cursor to {}", path.display()))?;
        }
    }

    print_tick(sensor.name(), &tick, &labels, &config.format)
}

fn read_cursor(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw.trim().to_string())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read cursor from {}", path.display()))
        }
    }
}

#[derive(Debug, Serialize)]
struct CacheReport {
    hits: u64,
    misses: u64,
}

#[derive(Debug, Serialize)]
struct TickReport<'a> {
    sensor: &'a str,
    run_requests: &'a [RunRequest],
    evaluations: &'a [AssetEvaluation],
    cursor: &'a str,
    cache: BTreeMap<&'static str, CacheReport>,
}

fn print_tick(
    sensor: &str,
    tick: &TickResult,
    labels: &RunLabels,
    format: &OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let cache = QueryKind::ALL
                .iter()
                .map(|kind| {
                    let counts = tick.cache_stats.get(*kind);
                    (
                        kind.as_str(),
                        CacheReport {
                            hits: counts.hits,
                            misses: counts.misses,
                        },
                    )
                })
                .collect();
            let report = TickReport {
                sensor,
                run_requests: &tick.run_requests,
                evaluations: &tick.evaluations,
                cursor: &tick.cursor,
                cache,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("Sensor: {sensor}");
            match tick.run_requests.first() {
                Some(request) => {
                    println!(
                        "Run requested for {} asset(s): {}",
                        request.asset_keys.len(),
                        join(&request.asset_keys).green()
                    );
                    for (key, value) in &request.tags {
                        println!("  tag {key}={value}");
                    }
                }
                None => println!("{}", "No run requested".dimmed()),
            }
            println!();
            println!("Evaluations:");
            for evaluation in &tick.evaluations {
                println!(
                    "  {} {}",
                    evaluation.asset_key,
                    format_decision_colored(&evaluation.decision, labels)
                );
                if !evaluation.updated_parents.is_empty() {
                    println!("    updated: {}", join(&evaluation.updated_parents));
                }
                if !evaluation.stale_parents.is_empty() {
                    println!("    stale:   {}", join(&evaluation.stale_parents));
                }
            }
            println!();
            println!(
                "Store queries: {} ({} served from cache)",
                tick.cache_stats.total_misses(),
                tick.cache_stats.total_hits()
            );
            println!("Cursor: {}", tick.cursor);
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct EvaluationRow {
                #[tabled(rename = "Asset")]
                asset: String,
                #[tabled(rename = "Decision")]
                decision: String,
                #[tabled(rename = "Updated")]
                updated: String,
                #[tabled(rename = "Stale")]
                stale: String,
                #[tabled(rename = "Cursor")]
                cursor: String,
            }

            let rows: Vec<_> = tick
                .evaluations
                .iter()
                .map(|e| EvaluationRow {
                    asset: e.asset_key.to_string(),
                    decision: decision_label(&e.decision, labels),
                    updated: join(&e.updated_parents),
                    stale: join(&e.stale_parents),
                    cursor: e.cursor.map_or_else(String::new, |id| id.to_string()),
                })
                .collect();

            if rows.is_empty() {
                println!("No monitored assets");
            } else {
                println!("{}", Table::new(rows));
            }
            println!("Cursor: {}", tick.cursor);
        }
    }

    Ok(())
}

fn join(keys: &BTreeSet<AssetKey>) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn decision_label(decision: &Decision, labels: &RunLabels) -> String {
    match decision {
        Decision::Selected => "selected".to_string(),
        Decision::NotUpdated => "not updated".to_string(),
        Decision::NoParents => "no parents".to_string(),
        Decision::BlockedByInProgressRun { parent } => {
            let run = labels
                .get(&parent.run_id)
                .cloned()
                .unwrap_or_else(|| parent.run_id.to_string());
            format!("blocked by {} (run {run})", parent.asset_key)
        }
    }
}

fn format_decision_colored(decision: &Decision, labels: &RunLabels) -> String {
    let label = decision_label(decision, labels);
    match decision {
        Decision::Selected => label.green().to_string(),
        Decision::BlockedByInProgressRun { .. } => label.yellow().to_string(),
        Decision::NotUpdated | Decision::NoParents => label.dimmed().to_string(),
    }
}

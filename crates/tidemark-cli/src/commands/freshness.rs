//! Freshness command - compute how late upstream data is under a policy.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use owo_colors::OwoColorize;

use tidemark_core::AssetKey;
use tidemark_flow::freshness::{FreshnessPolicy, UpstreamTimes};

use crate::{Config, OutputFormat};

/// Arguments for the freshness command.
#[derive(Debug, Args)]
pub struct FreshnessArgs {
    /// Policy as JSON, e.g. `{"type":"minimum","minimum_freshness_minutes":60}`.
    #[arg(long)]
    pub policy: String,

    /// Evaluation time (RFC 3339). Defaults to now.
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Upstream materialization time as `key=<rfc3339>` or `key=none`.
    #[arg(long = "upstream", short = 'u', value_parser = parse_upstream)]
    pub upstream: Vec<(AssetKey, Option<DateTime<Utc>>)>,
}

/// Execute the freshness command.
///
/// # Errors
///
/// Returns an error if the policy is invalid.
pub fn execute(args: &FreshnessArgs, config: &Config) -> Result<()> {
    let policy: FreshnessPolicy =
        serde_json::from_str(&args.policy).context("invalid freshness policy")?;
    let at = args.at.unwrap_or_else(Utc::now);
    let upstream: UpstreamTimes = args.upstream.iter().cloned().collect();

    let minutes_late = policy.minutes_late(at, &upstream);
    tracing::debug!(?policy, %at, upstreams = upstream.len(), ?minutes_late, "evaluated freshness");

    match config.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "policy": policy,
                    "evaluation_time": at.to_rfc3339(),
                    "minutes_late": minutes_late,
                }))?
            );
        }
        OutputFormat::Text | OutputFormat::Table => {
            println!("Evaluated at: {}", at.to_rfc3339());
            match minutes_late {
                Some(late) if late > 0.0 => println!("{}", format!("{late:.2} minutes late").red()),
                Some(_) => println!("{}", "Fresh".green()),
                None => println!("{}", "Unknown (missing upstream data)".yellow()),
            }
        }
    }

    Ok(())
}

fn parse_upstream(raw: &str) -> Result<(AssetKey, Option<DateTime<Utc>>)> {
    let (key, time) = raw
        .split_once('=')
        .context("expected key=<rfc3339|none>")?;
    let key = AssetKey::parse(key)?;
    if time.eq_ignore_ascii_case("none") {
        return Ok((key, None));
    }
    let time = DateTime::parse_from_rfc3339(time)
        .with_context(|| format!("invalid timestamp {time:?}"))?
        .with_timezone(&Utc);
    Ok((key, Some(time)))
}

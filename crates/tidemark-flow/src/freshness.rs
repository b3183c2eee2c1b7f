//! Freshness policies: how late is an asset's upstream data?
//!
//! A [`FreshnessPolicy`] turns the materialization times of an asset's
//! upstream dependencies into a number of minutes late relative to an
//! evaluation time. `None` means lateness cannot be determined because some
//! upstream has never been materialized.
//!
//! ## Policies
//!
//! - [`FreshnessPolicy::Minimum`]: upstream data must be no older than a fixed
//!   window before the evaluation time.
//! - [`FreshnessPolicy::CronMinimum`]: upstream data must include everything
//!   up to the most recent cron tick that is at least the window old.
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//!
//! use chrono::{TimeZone, Utc};
//! use tidemark_core::AssetKey;
//! use tidemark_flow::freshness::FreshnessPolicy;
//!
//! let policy = FreshnessPolicy::minimum_freshness(30.0).unwrap();
//! let eval = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
//! let upstream = BTreeMap::from([(
//!     AssetKey::parse("raw/events").unwrap(),
//!     Some(Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()),
//! )]);
//!
//! assert_eq!(policy.minutes_late(eval, &upstream), Some(30.0));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use tidemark_core::AssetKey;

use crate::error::{Error, Result};
use crate::queryer::CachingInstanceQueryer;

/// Upper bound on a freshness window (about 1900 years).
const MAX_FRESHNESS_MINUTES: f64 = 1.0e9;

/// Materialization time per upstream asset; `None` if never materialized.
pub type UpstreamTimes = BTreeMap<AssetKey, Option<DateTime<Utc>>>;

/// A freshness requirement attached to an asset.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicyDef", into = "PolicyDef")]
pub enum FreshnessPolicy {
    /// Fixed window before the evaluation time.
    Minimum {
        /// Window length in minutes.
        minimum_freshness_minutes: f64,
    },
    /// Window relative to the most recent qualifying cron tick.
    CronMinimum(CronMinimumFreshness),
}

/// Parameters of [`FreshnessPolicy::CronMinimum`].
#[derive(Clone)]
pub struct CronMinimumFreshness {
    minimum_freshness_minutes: f64,
    cron_schedule: String,
    schedule: Schedule,
}

impl CronMinimumFreshness {
    /// Window length in minutes.
    #[must_use]
    pub fn minimum_freshness_minutes(&self) -> f64 {
        self.minimum_freshness_minutes
    }

    /// The cron expression as configured.
    #[must_use]
    pub fn cron_schedule(&self) -> &str {
        &self.cron_schedule
    }

    /// Latest tick `T` with `T + window <= evaluation_time`, strictly before
    /// the evaluation time.
    fn latest_required_tick(
        &self,
        evaluation_time: DateTime<Utc>,
        window: Duration,
    ) -> Option<DateTime<Utc>> {
        let bound = evaluation_time.checked_sub_signed(window)?;
        let start = bound.checked_add_signed(Duration::seconds(1))?;
        self.schedule
            .after(&start)
            .rev()
            .find(|tick| *tick <= bound && *tick < evaluation_time)
    }
}

impl PartialEq for CronMinimumFreshness {
    fn eq(&self, other: &Self) -> bool {
        self.minimum_freshness_minutes == other.minimum_freshness_minutes
            && self.cron_schedule == other.cron_schedule
    }
}

impl fmt::Debug for CronMinimumFreshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronMinimumFreshness")
            .field("minimum_freshness_minutes", &self.minimum_freshness_minutes)
            .field("cron_schedule", &self.cron_schedule)
            .finish()
    }
}

impl fmt::Debug for FreshnessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimum {
                minimum_freshness_minutes,
            } => f
                .debug_struct("Minimum")
                .field("minimum_freshness_minutes", minimum_freshness_minutes)
                .finish(),
            Self::CronMinimum(inner) => f.debug_tuple("CronMinimum").field(inner).finish(),
        }
    }
}

impl FreshnessPolicy {
    /// Upstream data must be no older than `minimum_freshness_minutes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the window is negative, not finite, or too large.
    pub fn minimum_freshness(minimum_freshness_minutes: f64) -> Result<Self> {
        validate_minutes(minimum_freshness_minutes)?;
        Ok(Self::Minimum {
            minimum_freshness_minutes,
        })
    }

    /// Upstream data must cover the most recent `cron_schedule` tick that is
    /// at least `minimum_freshness_minutes` old.
    ///
    /// Five-field expressions (minute through day of week) are accepted
    /// alongside the six- and seven-field forms with seconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the window is invalid or the expression does not parse.
    pub fn cron_minimum_freshness(
        minimum_freshness_minutes: f64,
        cron_schedule: impl Into<String>,
    ) -> Result<Self> {
        validate_minutes(minimum_freshness_minutes)?;
        let cron_schedule = cron_schedule.into();
        let schedule = parse_schedule(&cron_schedule)?;
        Ok(Self::CronMinimum(CronMinimumFreshness {
            minimum_freshness_minutes,
            cron_schedule,
            schedule,
        }))
    }

    /// Window length in minutes.
    #[must_use]
    pub fn minimum_freshness_minutes(&self) -> f64 {
        match self {
            Self::Minimum {
                minimum_freshness_minutes,
            } => *minimum_freshness_minutes,
            Self::CronMinimum(inner) => inner.minimum_freshness_minutes,
        }
    }

    /// Minutes late at `evaluation_time`, the maximum across upstreams.
    ///
    /// Returns `None` if any upstream has no materialization time (or the
    /// required schedule tick cannot be located), and `Some(0.0)` for an
    /// empty upstream map.
    #[must_use]
    pub fn minutes_late(
        &self,
        evaluation_time: DateTime<Utc>,
        upstream_times: &UpstreamTimes,
    ) -> Option<f64> {
        let window = window_duration(self.minimum_freshness_minutes());
        let mut late = 0.0_f64;

        match self {
            Self::Minimum { .. } => {
                let minimum_time = evaluation_time.checked_sub_signed(window)?;
                for upstream in upstream_times.values() {
                    let upstream = (*upstream)?;
                    if upstream < minimum_time {
                        late = late.max(minutes_between(upstream, minimum_time));
                    }
                }
            }
            Self::CronMinimum(inner) => {
                if upstream_times.values().any(Option::is_none) {
                    return None;
                }
                if upstream_times.is_empty() {
                    return Some(0.0);
                }
                let tick = inner.latest_required_tick(evaluation_time, window)?;
                let expected_by = tick.checked_add_signed(window)?;
                for upstream in upstream_times.values().flatten() {
                    if *upstream < tick {
                        late = late.max(minutes_between(expected_by, evaluation_time));
                    }
                }
            }
        }

        Some(late)
    }
}

/// Collects the latest materialization time of each parent through the
/// per-tick queryer.
///
/// # Errors
///
/// Propagates fact-store failures.
pub fn upstream_materialization_times(
    queryer: &mut CachingInstanceQueryer<'_>,
    parents: &BTreeSet<AssetKey>,
) -> Result<UpstreamTimes> {
    let mut times = BTreeMap::new();
    for parent in parents {
        let latest = queryer.latest_materialization(parent, None)?;
        times.insert(parent.clone(), latest.map(|record| record.timestamp));
    }
    Ok(times)
}

fn validate_minutes(minutes: f64) -> Result<()> {
    if !minutes.is_finite() || minutes < 0.0 || minutes > MAX_FRESHNESS_MINUTES {
        return Err(Error::configuration(format!(
            "minimum_freshness_minutes must be between 0 and {MAX_FRESHNESS_MINUTES}, got {minutes}"
        )));
    }
    Ok(())
}

fn parse_schedule(expression: &str) -> Result<Schedule> {
    let invalid = |message: String| Error::InvalidCronSchedule {
        expression: expression.to_string(),
        message,
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday = normalize_day_of_week(weekday).map_err(invalid)?;
            format!("0 {minute} {hour} {day} {month} {weekday}")
        }
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => expression.to_string(),
        _ => {
            return Err(invalid(format!(
                "expected 5, 6 or 7 fields, found {}",
                fields.len()
            )));
        }
    };
    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Rewrites a standard day-of-week field (0-7, Sunday is 0 or 7) into the
/// 1-7 numbering of the `cron` crate (Sunday is 1).
///
/// Numeric items are expanded into an explicit list; named items (`MON`,
/// `MON-FRI`) and `*`/`?` pass through unchanged.
fn normalize_day_of_week(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut named = Vec::new();
    let mut days = BTreeSet::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }

        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(parse_day_number(step)?)),
            None => (item, None),
        };
        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((start, end)) => (parse_day_number(start)?, parse_day_number(end)?),
            None => {
                let day = parse_day_number(base)?;
                (day, if step.is_some() { 6 } else { day })
            }
        };
        if start > 7 || end > 7 || start > end {
            return Err(format!("invalid day-of-week item '{item}'"));
        }
        let step = match step {
            Some(0) => return Err(format!("zero step in day-of-week item '{item}'")),
            Some(step) => usize::from(step),
            None => 1,
        };
        days.extend((start..=end).step_by(step).map(|day| day % 7 + 1));
    }

    let mut items: Vec<String> = days.iter().map(u8::to_string).collect();
    items.extend(named);
    Ok(items.join(","))
}

fn parse_day_number(raw: &str) -> std::result::Result<u8, String> {
    raw.parse()
        .map_err(|_| format!("invalid day-of-week value '{raw}'"))
}

#[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRESHNESS_MINUTES
fn window_duration(minutes: f64) -> Duration {
    Duration::milliseconds((minutes * 60_000.0).round() as i64)
}

#[allow(clippy::cast_precision_loss)] // sub-millisecond precision is irrelevant here
fn minutes_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 60_000.0
}

/// Serialized form of [`FreshnessPolicy`].
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum PolicyDef {
    Minimum {
        minimum_freshness_minutes: f64,
    },
    CronMinimum {
        minimum_freshness_minutes: f64,
        cron_schedule: String,
    },
}

impl TryFrom<PolicyDef> for FreshnessPolicy {
    type Error = Error;

    fn try_from(def: PolicyDef) -> Result<Self> {
        match def {
            PolicyDef::Minimum {
                minimum_freshness_minutes,
            } => Self::minimum_freshness(minimum_freshness_minutes),
            PolicyDef::CronMinimum {
                minimum_freshness_minutes,
                cron_schedule,
            } => Self::cron_minimum_freshness(minimum_freshness_minutes, cron_schedule),
        }
    }
}

impl From<FreshnessPolicy> for PolicyDef {
    fn from(policy: FreshnessPolicy) -> Self {
        match policy {
            FreshnessPolicy::Minimum {
                minimum_freshness_minutes,
            } => Self::Minimum {
                minimum_freshness_minutes,
            },
            FreshnessPolicy::CronMinimum(inner) => Self::CronMinimum {
                minimum_freshness_minutes: inner.minimum_freshness_minutes,
                cron_schedule: inner.cron_schedule,
            },
        }
    }
}

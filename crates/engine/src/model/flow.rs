//! Flows, triggers and schedule evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tessera_connectors::Location;

/// What starts a flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Only explicit run requests.
    #[default]
    Manual,
    /// Cron expression or `@every <n>{s|m|h}`.
    Schedule { expression: String },
    /// New items under a watched location.
    Watch { location: Location },
}

/// Whether runs of the same flow may overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    #[default]
    Serialize,
    Parallel,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialize => write!(f, "serialize"),
            Self::Parallel => write!(f, "parallel"),
        }
    }
}

/// A set of steps run together under one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub steps: Vec<String>,

    #[serde(default)]
    pub trigger: Trigger,

    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
}

/// Parsed schedule expression.
#[derive(Debug, Clone)]
pub enum Schedule {
    Cron(Box<cron::Schedule>),
    /// Instants aligned to multiples of the period since the Unix epoch.
    Every(Duration),
}

impl Schedule {
    /// Parse a schedule expression.
    ///
    /// Five-field cron expressions get a leading seconds field of `0`.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let expression = expression.trim();
        if let Some(period) = expression.strip_prefix("@every") {
            return parse_period(period.trim()).map(Schedule::Every);
        }

        let normalized = if expression.split_whitespace().count() == 5 {
            format!("0 {}", expression)
        } else {
            expression.to_string()
        };
        cron::Schedule::from_str(&normalized)
            .map(|s| Schedule::Cron(Box::new(s)))
            .map_err(|e| format!("invalid cron expression '{}': {}", expression, e))
    }

    /// First instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).next(),
            Schedule::Every(period) => {
                let secs = period.as_secs() as i64;
                let next = (after.timestamp().div_euclid(secs) + 1) * secs;
                DateTime::from_timestamp(next, 0)
            }
        }
    }

    /// Latest instant `t` with `after < t <= now`. Earlier missed instants
    /// are coalesced into it.
    pub fn latest_due(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if now <= after {
            return None;
        }
        match self {
            Schedule::Cron(schedule) => schedule.after(&after).take_while(|t| *t <= now).last(),
            Schedule::Every(period) => {
                let secs = period.as_secs() as i64;
                let latest = DateTime::from_timestamp(now.timestamp().div_euclid(secs) * secs, 0)?;
                (latest > after).then_some(latest)
            }
        }
    }
}

fn parse_period(period: &str) -> Result<Duration, String> {
    let (digits, unit) = period.split_at(period.trim_end_matches(char::is_alphabetic).len());
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid period '{}'", period))?;
    let secs = match unit {
        "s" | "" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return Err(format!("invalid period unit '{}'", unit)),
    };
    if secs == 0 {
        return Err("period must be positive".to_string());
    }
    Ok(Duration::from_secs(secs))
}

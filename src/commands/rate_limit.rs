use std::path::Path;

use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use crate::config::Town;
use crate::error::ExitError;
use crate::ratelimit::{RateLimitTracker, format_wait};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RateLimitAction {
    Status,
    Clear,
}

#[derive(Debug, Args)]
pub struct RateLimitArgs {
    /// What to do with the rig's rate limit state
    #[arg(value_enum, default_value_t = RateLimitAction::Status)]
    pub action: RateLimitAction,
    /// Rig to inspect (default: the only configured rig)
    #[arg(long)]
    pub rig: Option<String>,
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct RateLimitReport {
    pub rig: String,
    pub limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub account: String,
    pub consecutive_hits: u32,
    pub wait_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,
}

impl RateLimitArgs {
    pub fn execute(&self, town_root: Option<&Path>) -> anyhow::Result<()> {
        let town = Town::discover(town_root)?;
        let rig = town.select_rig(self.rig.as_deref())?;
        let rig_path = town
            .rig_path(&rig)
            .ok_or_else(|| ExitError::Config(format!("rig {rig:?} not found")))?;
        let tracker = RateLimitTracker::open(&rig_path)?;

        match self.action {
            RateLimitAction::Status => self.status(rig, &tracker),
            RateLimitAction::Clear => self.clear(&rig, &tracker),
        }
    }

    fn status(&self, rig: String, tracker: &RateLimitTracker) -> anyhow::Result<()> {
        let state = tracker.state();
        let wait = tracker.time_until_ready();
        let report = RateLimitReport {
            rig,
            limited: state.limited,
            detected_at: state.detected_at,
            source: state.source,
            account: state.account,
            consecutive_hits: state.consecutive_hits,
            wait_secs: wait.as_secs(),
            ready_at: state.backoff_until.filter(|_| state.limited),
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }
        if !report.limited {
            println!("Rig {}: not rate limited", report.rig);
            return Ok(());
        }
        println!("Rig {}: RATE LIMITED", report.rig);
        if let Some(at) = report.detected_at {
            println!("  Detected:  {}", at.to_rfc3339());
        }
        if !report.source.is_empty() {
            println!("  Source:    {}", report.source);
        }
        if !report.account.is_empty() {
            println!("  Account:   {}", report.account);
        }
        println!("  Hits:      {}", report.consecutive_hits);
        if wait.is_zero() {
            println!("  Backoff:   expired, next dispatch may proceed");
        } else {
            println!("  Backoff:   {} remaining", format_wait(wait));
        }
        if let Some(at) = report.ready_at {
            println!("  Ready at:  {}", at.to_rfc3339());
        }
        Ok(())
    }

    fn clear(&self, rig: &str, tracker: &RateLimitTracker) -> anyhow::Result<()> {
        let was_limited = tracker.state().limited;
        if was_limited {
            tracker.clear();
            tracker.save()?;
            tracing::info!(%rig, "rate limit cleared by operator");
        }

        if self.json {
            let out = serde_json::json!({ "rig": rig, "cleared": was_limited });
            println!("{}", serde_json::to_string_pretty(&out)?);
        } else if was_limited {
            println!("Cleared rate limit for {rig}");
        } else {
            println!("No rate limit was active for {rig}");
        }
        Ok(())
    }
}

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;

use super::EventLog;

/// Event feed file at the town root.
pub const EVENTS_FILE: &str = ".events.jsonl";

/// Append-only JSON-lines event feed.
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    path: PathBuf,
    town: String,
}

#[derive(Serialize)]
struct Event<'a> {
    ts: String,
    town: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    actor: &'a str,
    payload: serde_json::Value,
}

impl JsonlEventLog {
    pub fn new(town_root: &Path, town: &str) -> Self {
        Self {
            path: town_root.join(EVENTS_FILE),
            town: town.to_string(),
        }
    }
}

impl EventLog for JsonlEventLog {
    fn log(&self, kind: &str, actor: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let event = Event {
            ts: Utc::now().to_rfc3339(),
            town: &self.town,
            kind,
            actor,
            payload,
        };
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        // A single write per line keeps concurrent appenders from interleaving.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(&line))
            .with_context(|| format!("appending to {}", self.path.display()))
    }
}

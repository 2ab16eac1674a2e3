use crate::output;
use arbor_overlay::HostStatus;
use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
/// If --output-dir was provided, also writes to the JSONL file.
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();

        output::write_jsonl_line(&json);
    }
}

pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub hosts: usize,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(mode: &str, hosts: usize) -> Self {
        Self {
            event: "started",
            mode: mode.to_string(),
            hosts,
            timestamp: now_iso(),
        }
    }
}

#[derive(Serialize)]
pub struct EventTree {
    pub event: &'static str,
    pub tree: String,
    pub nodes: usize,
    pub depth: usize,
    pub branching: usize,
    pub elapsed_s: f64,
}

// ── Round events ────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventRound {
    pub event: &'static str,
    pub protocol: String,
    pub round: u32,
    /// Nodes the root heard back from, itself included.
    pub reached: usize,
    pub expected: usize,
    pub duration_ms: f64,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventRoundFailed {
    pub event: &'static str,
    pub protocol: String,
    pub round: u32,
    pub reason: String,
    pub elapsed_s: f64,
}

// ── Status ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventHostStatus {
    pub event: &'static str,
    #[serde(flatten)]
    pub status: HostStatus,
}

/// Reply of the status service, as seen by a client.
#[derive(Serialize)]
pub struct EventServiceStatus {
    pub event: &'static str,
    pub rtt_ms: f64,
    #[serde(flatten)]
    pub reply: crate::protocols::StatusReply,
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub mode: String,
    pub rounds: u32,
    pub successful: u32,
    pub failed: u32,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub elapsed_s: f64,
}

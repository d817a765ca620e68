//! Trace event model: one JSONL line per recorded production request, plus
//! the pre-scan that sizes the replay worker pool.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Floor for the replay worker pool.
pub const MIN_POOL: usize = 20;
/// Safety ceiling; the pool never exceeds this no matter the burst.
pub const POOL_CEILING: usize = 500;
/// Workers per peak-100ms event, covering requests that outlive their
/// inter-arrival gap.
pub const BURST_FACTOR: usize = 10;

/// The five endpoint/method pairs the replay knows how to reissue, plus a
/// fallback that is recorded but never aborts a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    DatePicker,
    PickerStatus,
    Crossword,
    Plays,
    Puzzles,
    Unknown,
}

impl Endpoint {
    pub fn classify(method: &str, path: &str) -> Endpoint {
        let path = path.trim_end_matches('/');
        match (method, path) {
            ("GET", "/date-picker") => Endpoint::DatePicker,
            ("POST", "/postPickerStatus") => Endpoint::PickerStatus,
            ("GET", "/crossword") => Endpoint::Crossword,
            ("POST", "/api/v1/plays") => Endpoint::Plays,
            ("GET", "/api/v1/puzzles") => Endpoint::Puzzles,
            _ => Endpoint::Unknown,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    ts: i64,
    endpoint: String,
    #[serde(rename = "delayMs")]
    delay_ms: i64,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    series: Option<String>,
    #[serde(rename = "puzzleId", default)]
    puzzle_id: Option<String>,
    #[serde(default)]
    offset: Option<i64>,
    #[serde(rename = "isLastReq", default)]
    is_last_req: Option<i64>,
}

/// One recorded request, ordered by source timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    /// Monotonically increasing position in the trace.
    pub index: usize,
    pub ts: i64,
    pub endpoint: Endpoint,
    /// The path as recorded, kept for reporting unknown endpoints.
    pub raw_endpoint: String,
    pub method: String,
    pub user_id: Option<String>,
    /// Delay since the previous event, before speed scaling.
    pub delay_ms: i64,
    pub series: Option<String>,
    pub puzzle_id: Option<String>,
    pub offset: Option<i64>,
    pub is_last_req: bool,
}

/// Parse one JSONL line. `None` for blank or malformed lines; the caller
/// decides whether to count them.
pub fn parse_line(line: &str, index: usize) -> Option<TraceEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawEvent = serde_json::from_str(line).ok()?;
    let method = raw.method.unwrap_or_else(|| "GET".into());
    let endpoint = Endpoint::classify(&method, &raw.endpoint);
    Some(TraceEvent {
        index,
        ts: raw.ts,
        endpoint,
        raw_endpoint: raw.endpoint,
        method,
        user_id: raw.user_id,
        delay_ms: raw.delay_ms,
        series: raw.series,
        puzzle_id: raw.puzzle_id,
        offset: raw.offset,
        is_last_req: raw.is_last_req.unwrap_or(0) != 0,
    })
}

/// Read a whole trace into memory, silently skipping malformed lines.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|_| Error::TraceUnavailable(path.to_path_buf()))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    let mut skipped = 0usize;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line, events.len()) {
            Some(event) => events.push(event),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "malformed trace lines skipped");
    }
    info!(events = events.len(), path = %path.display(), "trace loaded");
    Ok(events)
}

/// Distinct user ids appearing in the trace, in first-seen order.
pub fn unique_users(events: &[TraceEvent]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut users = Vec::new();
    for event in events {
        if let Some(uid) = &event.user_id {
            if seen.insert(uid.clone()) {
                users.push(uid.clone());
            }
        }
    }
    users
}

/// What the pre-scan learned about event density after speed scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurstProfile {
    pub events: usize,
    /// Most events landing in any single 100 ms window.
    pub peak_100ms: usize,
    pub max_rps: usize,
    pub avg_rps: f64,
}

impl BurstProfile {
    /// Worker-pool size that accommodates the peak burst without exceeding
    /// the safety ceiling.
    pub fn pool_size(&self) -> usize {
        (self.peak_100ms * BURST_FACTOR).max(MIN_POOL).min(POOL_CEILING)
    }
}

/// Bucket the scaled dispatch offsets into 100 ms and 1 s windows. Works on
/// raw inter-event delays so the streaming variant can feed it line by line
/// through [`BurstScanner`].
pub fn scan_bursts(delays: impl IntoIterator<Item = i64>, speed: f64) -> BurstProfile {
    let mut scanner = BurstScanner::new(speed);
    for delay in delays {
        scanner.push(delay);
    }
    scanner.finish()
}

/// Incremental form of [`scan_bursts`].
pub struct BurstScanner {
    speed: f64,
    cumulative_ms: i64,
    events: usize,
    per_100ms: HashMap<i64, usize>,
    per_1000ms: HashMap<i64, usize>,
}

impl BurstScanner {
    pub fn new(speed: f64) -> Self {
        BurstScanner {
            speed: if speed > 0.0 { speed } else { 1.0 },
            cumulative_ms: 0,
            events: 0,
            per_100ms: HashMap::new(),
            per_1000ms: HashMap::new(),
        }
    }

    /// Same timing basis as the dispatch loop: the event's own delay counts
    /// toward its offset.
    pub fn push(&mut self, delay_ms: i64) {
        self.cumulative_ms += delay_ms.max(0);
        let scaled = (self.cumulative_ms as f64 / self.speed) as i64;
        *self.per_100ms.entry(scaled / 100).or_insert(0) += 1;
        *self.per_1000ms.entry(scaled / 1000).or_insert(0) += 1;
        self.events += 1;
    }

    pub fn finish(self) -> BurstProfile {
        let peak_100ms = self.per_100ms.values().copied().max().unwrap_or(0);
        let max_rps = self.per_1000ms.values().copied().max().unwrap_or(0);
        let avg_rps = if self.per_1000ms.is_empty() {
            0.0
        } else {
            self.events as f64 / self.per_1000ms.len() as f64
        };
        BurstProfile { events: self.events, peak_100ms, max_rps, avg_rps }
    }
}

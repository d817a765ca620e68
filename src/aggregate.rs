//! Aggregation: turning the stream of completion records into per-wave and
//! overall statistics.
//!
//! An [`Aggregate`] stores raw, mergeable data — counts and the records
//! themselves — and nothing else. Derived numbers (means, percentiles,
//! deviations) are computed by the report conversion after the terminal
//! barrier resolves, so the hot path never contends on statistics.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::metric::{CompletionRecord, Metric, ReplayRecord};

/// Collects [`Metric`]s into a mergeable intermediate form.
///
/// `merge` must be associative and commutative: worker-local aggregates are
/// combined in whatever order the workers drain.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Raw results of a wave run: every completion record, plus the run metadata
/// the report needs. Statistics are derived later.
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct RunAggregate {
    pub title: String,
    pub rps: usize,
    pub duration: usize,
    pub puzzle_id: String,
    pub state_len: usize,
    pub total_time_ms: f64,
    /// Set when the run was cancelled or the latch timed out before every
    /// record arrived.
    pub partial: bool,
    pub records: Vec<CompletionRecord>,
}

impl Aggregate for RunAggregate {
    type Metric = CompletionRecord;

    fn new() -> Self {
        RunAggregate::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.records.push(metric.clone());
    }

    fn merge(&mut self, other: Self) {
        self.records.extend(other.records);
        self.partial |= other.partial;
    }
}

/// Raw results of a replay run. Counters are exact even when the record list
/// is a sample (streaming variant).
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ReplayAggregate {
    pub source: String,
    pub speed: f64,
    pub original_duration_ms: i64,
    pub scheduled_duration_ms: i64,
    pub actual_duration_ms: i64,
    pub total_events: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub total_latency_ms: i64,
    /// Successful latencies for percentile derivation. The streaming
    /// variant fills this with a reservoir sample; counters stay exact.
    pub latency_samples: Vec<i64>,
    pub partial: bool,
    pub records: Vec<ReplayRecord>,
}

impl Aggregate for ReplayAggregate {
    type Metric = ReplayRecord;

    fn new() -> Self {
        ReplayAggregate::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.total_events += 1;
        if metric.success {
            self.success_count += 1;
            self.total_latency_ms += metric.latency_ms;
            self.latency_samples.push(metric.latency_ms);
        } else {
            self.fail_count += 1;
        }
        self.records.push(metric.clone());
    }

    fn merge(&mut self, other: Self) {
        self.total_events += other.total_events;
        self.success_count += other.success_count;
        self.fail_count += other.fail_count;
        self.total_latency_ms += other.total_latency_ms;
        self.latency_samples.extend(other.latency_samples);
        self.partial |= other.partial;
        self.records.extend(other.records);
    }
}

/// Derived statistics for one wave.
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct WaveStats {
    pub wave_number: u32,
    pub threads: usize,
    pub success: usize,
    pub failed: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p95: f64,
    pub std_dev: f64,
    /// Successful journeys slower than `avg + 2·std_dev`.
    pub outliers: usize,
    /// Mean latency per step (1-4) over the successful subset.
    pub step_avg_ms: [f64; 4],
}

/// Derived statistics for the whole run.
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct OverallStats {
    pub total_threads: usize,
    pub success: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Order statistic at `⌊0.95·N⌋` of a sorted vector. Not interpolated;
/// empty input yields 0.
pub fn p95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    sorted[((sorted.len() as f64) * 0.95) as usize]
}

/// The middle element of a sorted vector; empty input yields 0.
pub fn p50(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    sorted[sorted.len() / 2]
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn sorted_successful_latencies(records: &[&CompletionRecord]) -> Vec<f64> {
    let mut latencies: Vec<f64> = records
        .iter()
        .filter(|r| r.succeeded())
        .map(|r| r.total_latency_ms())
        .collect();
    latencies.sort_by(f64::total_cmp);
    latencies
}

/// Group records by wave and derive each wave's statistics. Pure: the same
/// record vector always yields the same numbers.
pub fn wave_stats(records: &[CompletionRecord]) -> Vec<WaveStats> {
    let mut by_wave: BTreeMap<u32, Vec<&CompletionRecord>> = BTreeMap::new();
    for record in records {
        by_wave.entry(record.wave).or_default().push(record);
    }

    by_wave
        .into_iter()
        .map(|(wave_number, wave_records)| {
            let latencies = sorted_successful_latencies(&wave_records);
            let success = latencies.len();
            let avg = mean(&latencies);
            let sigma = std_dev(&latencies, avg);
            let outliers =
                latencies.iter().filter(|&&l| l > avg + 2.0 * sigma).count();

            let mut step_avg_ms = [0.0f64; 4];
            for (i, slot) in step_avg_ms.iter_mut().enumerate() {
                let step_latencies: Vec<f64> = wave_records
                    .iter()
                    .filter(|r| r.succeeded())
                    .filter_map(|r| r.result.as_ref().and_then(|j| j.step_latency(i + 1)))
                    .collect();
                *slot = mean(&step_latencies);
            }

            WaveStats {
                wave_number,
                threads: wave_records.len(),
                success,
                failed: wave_records.len() - success,
                min: latencies.first().copied().unwrap_or(0.0),
                max: latencies.last().copied().unwrap_or(0.0),
                avg,
                p95: p95(&latencies),
                std_dev: sigma,
                outliers,
                step_avg_ms,
            }
        })
        .collect()
}

/// Derive the run-level totals and order statistics.
pub fn overall_stats(records: &[CompletionRecord]) -> OverallStats {
    let refs: Vec<&CompletionRecord> = records.iter().collect();
    let latencies = sorted_successful_latencies(&refs);
    let success = latencies.len();
    let total = records.len();
    OverallStats {
        total_threads: total,
        success,
        failed: total - success,
        success_rate: if total == 0 { 0.0 } else { success as f64 / total as f64 * 100.0 },
        min: latencies.first().copied().unwrap_or(0.0),
        max: latencies.last().copied().unwrap_or(0.0),
        avg: mean(&latencies),
        p50: p50(&latencies),
        p95: p95(&latencies),
    }
}

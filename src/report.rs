//! Reports: the pure data trees derived from an aggregate, and the
//! reporters that push them somewhere.
//!
//! A [`Report`] is a deterministic transformation of an [`Aggregate`] — no
//! I/O, no clock reads beyond the header timestamp. A [`Reporter`] owns the
//! side effects: the terminal summary for the operator, a JSON file for the
//! downstream CSV/HTML renderers.

use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::{
    Aggregate, OverallStats, ReplayAggregate, RunAggregate, WaveStats, overall_stats, wave_stats,
};
use crate::error::Result;
use crate::metric::{CompletionRecord, ReplayRecord};

/// Processed form of an [`Aggregate`]: derived statistics, ready to render.
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Consumes a [`Report`] and performs side effects: printing, persisting,
/// shipping elsewhere. The computation layer stays pure; reporters don't.
#[async_trait]
pub trait Reporter<A: Aggregate, R: Report<A>> {
    async fn report(&self, report: &R) -> Result<()>;
}

/// The `config` block the downstream renderers expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    pub rps: usize,
    pub duration: usize,
    pub total_threads: usize,
    pub puzzle_id: String,
    pub state_len: usize,
    pub true_rps: bool,
}

/// The full results tree for a wave run, in the shape the report renderers
/// consume.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub title: String,
    pub timestamp: String,
    pub config: ReportConfig,
    pub waves: Vec<WaveStats>,
    pub overall: OverallStats,
    pub results: Vec<CompletionRecord>,
    pub total_time_ms: f64,
    pub partial: bool,
}

impl From<RunAggregate> for RunReport {
    fn from(agg: RunAggregate) -> Self {
        let waves = wave_stats(&agg.records);
        let overall = overall_stats(&agg.records);
        RunReport {
            title: agg.title,
            timestamp: chrono::Utc::now().to_rfc3339(),
            config: ReportConfig {
                rps: agg.rps,
                duration: agg.duration,
                total_threads: agg.rps * agg.duration,
                puzzle_id: agg.puzzle_id,
                state_len: agg.state_len,
                true_rps: true,
            },
            waves,
            overall,
            results: agg.records,
            total_time_ms: agg.total_time_ms,
            partial: agg.partial,
        }
    }
}

impl Report<RunAggregate> for RunReport {}

/// Summary of a traffic replay.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayReport {
    pub source: String,
    pub timestamp: String,
    pub speed: f64,
    pub original_duration_ms: i64,
    pub scheduled_duration_ms: i64,
    pub actual_duration_ms: i64,
    pub total_events: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub avg_latency_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub results: Vec<ReplayRecord>,
    pub partial: bool,
}

impl From<ReplayAggregate> for ReplayReport {
    fn from(agg: ReplayAggregate) -> Self {
        let avg_latency_ms = if agg.success_count == 0 {
            0.0
        } else {
            agg.total_latency_ms as f64 / agg.success_count as f64
        };
        let mut sorted: Vec<f64> = agg.latency_samples.iter().map(|&l| l as f64).collect();
        sorted.sort_by(f64::total_cmp);
        ReplayReport {
            source: agg.source,
            timestamp: chrono::Utc::now().to_rfc3339(),
            speed: agg.speed,
            original_duration_ms: agg.original_duration_ms,
            scheduled_duration_ms: agg.scheduled_duration_ms,
            actual_duration_ms: agg.actual_duration_ms,
            total_events: agg.total_events,
            success_count: agg.success_count,
            fail_count: agg.fail_count,
            avg_latency_ms,
            p50_ms: crate::aggregate::p50(&sorted),
            p95_ms: crate::aggregate::p95(&sorted),
            results: agg.records,
            partial: agg.partial,
        }
    }
}

impl Report<ReplayAggregate> for ReplayReport {}

/// Prints the operator-facing summary to stdout.
pub struct StdoutReporter;

#[async_trait]
impl Reporter<RunAggregate, RunReport> for StdoutReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        println!("{}", "=".repeat(62));
        println!("WAVE RUN SUMMARY: {}", report.title);
        println!("{}", "=".repeat(62));
        println!(
            "  {} req/s for {} s ({} journeys), puzzle {}",
            report.config.rps,
            report.config.duration,
            report.config.total_threads,
            report.config.puzzle_id
        );
        println!("{}", "-".repeat(62));
        println!("  wave  threads  ok  fail     avg      p95      max  outliers");
        for wave in &report.waves {
            println!(
                "  {:>4}  {:>7}  {:>2}  {:>4}  {:>6.0}ms {:>6.0}ms {:>6.0}ms  {:>8}",
                wave.wave_number,
                wave.threads,
                wave.success,
                wave.failed,
                wave.avg,
                wave.p95,
                wave.max,
                wave.outliers
            );
        }
        println!("{}", "-".repeat(62));
        let overall = &report.overall;
        println!(
            "  total {} | ok {} | fail {} | {:.1}% success",
            overall.total_threads, overall.success, overall.failed, overall.success_rate
        );
        println!(
            "  latency min {:.0}ms avg {:.0}ms p50 {:.0}ms p95 {:.0}ms max {:.0}ms",
            overall.min, overall.avg, overall.p50, overall.p95, overall.max
        );
        println!("  wall clock {:.1}s", report.total_time_ms / 1000.0);
        if report.partial {
            println!("  WARNING: run did not drain; results are partial");
        }
        println!("{}", "=".repeat(62));
        Ok(())
    }
}

#[async_trait]
impl Reporter<ReplayAggregate, ReplayReport> for StdoutReporter {
    async fn report(&self, report: &ReplayReport) -> Result<()> {
        println!("{}", "=".repeat(62));
        println!("TRAFFIC REPLAY SUMMARY");
        println!("{}", "=".repeat(62));
        println!("  Source file:      {}", report.source);
        println!("  Speed factor:     {:.1}x", report.speed);
        println!("  Original traffic: {:.1} s", report.original_duration_ms as f64 / 1000.0);
        println!("  Scheduled replay: {:.1} s", report.scheduled_duration_ms as f64 / 1000.0);
        println!("  Actual execution: {:.1} s", report.actual_duration_ms as f64 / 1000.0);
        println!("{}", "-".repeat(62));
        println!("  Total events:     {}", report.total_events);
        println!("  Successful:       {}", report.success_count);
        println!("  Failed:           {}", report.fail_count);
        println!("  Avg latency:      {:.1} ms", report.avg_latency_ms);
        if report.partial {
            println!("  WARNING: replay did not drain; results are partial");
        }
        println!("{}", "=".repeat(62));
        Ok(())
    }
}

/// Writes the full results tree as JSON, the input format of the external
/// CSV/HTML renderers.
pub struct JsonFileReporter {
    pub path: PathBuf,
}

impl JsonFileReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileReporter { path: path.into() }
    }

    fn write<T: Serialize>(&self, value: &T) -> Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(value)?)?;
        tracing::info!(path = %self.path.display(), "results written");
        Ok(())
    }
}

#[async_trait]
impl Reporter<RunAggregate, RunReport> for JsonFileReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        self.write(report)
    }
}

#[async_trait]
impl Reporter<ReplayAggregate, ReplayReport> for JsonFileReporter {
    async fn report(&self, report: &ReplayReport) -> Result<()> {
        self.write(report)
    }
}

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

/// A `Metric` is a single observed measurement produced by the target under
/// load: one scripted step, one full journey, one replayed event.
///
/// Metrics are the most granular level of data the engine records. They are
/// collected into an [`crate::Aggregate`] as workers complete, and summarized
/// by a [`crate::Report`] once the run drains. Metrics stay raw on the hot
/// path; nothing derives statistics until the terminal barrier resolves.
///
/// Implementations must be cheap to clone and safe to hand across worker
/// tasks, which is what the supertrait bounds pin down.
pub trait Metric
where
    Self: PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// Wall clock in milliseconds since the epoch, the timestamp basis every
/// record in a report shares.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One static-asset fetch layered onto a journey step.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct AssetMetric {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub latency_ms: f64,
    pub success: bool,
}

/// Timing and outcome of a single journey step.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct StepMetric {
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub latency_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Static-asset fetches attributed to this step (with-assets variant).
    /// Their latency is already summed into `latency_ms`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assets: Vec<AssetMetric>,
}

/// One of the ten play posts inside step 4.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PlayIteration {
    pub iteration: u32,
    pub play_state: u8,
    pub latency_ms: f64,
}

/// The multi-iteration plays step: per-iteration records plus aggregates.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct PlaysMetric {
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    /// Sum of the iteration latencies.
    pub latency_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub iterations: Vec<PlayIteration>,
}

/// Everything measured for one journey invocation. A journey succeeds iff
/// every step succeeded; steps after the first failure are absent.
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct JourneyMetric {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step1: Option<StepMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step2: Option<StepMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step3: Option<StepMetric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step4: Option<PlaysMetric>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JourneyMetric {
    /// Total latency: steps 1-3 plus every step-4 iteration. Completed steps
    /// of a failed journey still count.
    pub fn total_latency_ms(&self) -> f64 {
        let mut total = 0.0;
        for step in [&self.step1, &self.step2, &self.step3].into_iter().flatten() {
            total += step.latency_ms;
        }
        if let Some(plays) = &self.step4 {
            total += plays.iterations.iter().map(|it| it.latency_ms).sum::<f64>();
        }
        total
    }

    /// Latency of the step selected by `index` (1-4), if it ran.
    pub fn step_latency(&self, index: usize) -> Option<f64> {
        match index {
            1 => self.step1.as_ref().map(|s| s.latency_ms),
            2 => self.step2.as_ref().map(|s| s.latency_ms),
            3 => self.step3.as_ref().map(|s| s.latency_ms),
            4 => self.step4.as_ref().map(|s| s.latency_ms),
            _ => None,
        }
    }
}

/// The unit handed from a worker to the aggregator: one journey (or crash)
/// tagged with its wave and virtual-thread index.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub wave: u32,
    pub thread: u32,
    pub launch_time: i64,
    pub completion_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JourneyMetric>,
    /// Set when the worker itself crashed rather than the journey failing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.result.as_ref().is_some_and(|r| r.success)
    }

    pub fn total_latency_ms(&self) -> f64 {
        self.result.as_ref().map(|r| r.total_latency_ms()).unwrap_or(0.0)
    }
}

/// One replayed trace event, as it lands in the replay report.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub index: usize,
    /// Offset the scheduler aimed for, ms from replay start.
    pub scheduled_ms: i64,
    /// Offset the request actually started at.
    pub actual_ms: i64,
    pub latency_ms: i64,
    /// `actual_ms + latency_ms`; the last response time bounds the run.
    pub response_ms: i64,
    pub success: bool,
    pub endpoint: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Metric for StepMetric {}
impl Metric for JourneyMetric {}
impl Metric for CompletionRecord {}
impl Metric for ReplayRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(latency_ms: f64) -> StepMetric {
        StepMetric {
            start_timestamp: 0,
            end_timestamp: 0,
            latency_ms,
            success: true,
            uid: None,
            error: None,
            assets: Vec::new(),
        }
    }

    #[test]
    fn total_latency_sums_steps_and_iterations() {
        let journey = JourneyMetric {
            step1: Some(step(10.0)),
            step2: Some(step(20.0)),
            step3: Some(step(30.0)),
            step4: Some(PlaysMetric {
                start_timestamp: 0,
                end_timestamp: 0,
                latency_ms: 15.0,
                success: true,
                error: None,
                iterations: vec![
                    PlayIteration { iteration: 1, play_state: 1, latency_ms: 5.0 },
                    PlayIteration { iteration: 2, play_state: 2, latency_ms: 10.0 },
                ],
            }),
            success: true,
            error: None,
        };
        assert_eq!(journey.total_latency_ms(), 75.0);
    }

    #[test]
    fn failed_journey_counts_completed_steps_only() {
        let journey = JourneyMetric {
            step1: Some(step(10.0)),
            step2: Some(step(20.0)),
            success: false,
            error: Some("unexpected response: HTTP 500".into()),
            ..Default::default()
        };
        assert_eq!(journey.total_latency_ms(), 30.0);
        assert!(journey.step3.is_none());
    }
}

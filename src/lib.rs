pub mod aggregate;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod journey;
pub mod metric;
pub mod report;
pub mod session;
pub mod trace;

pub use aggregate::{Aggregate, OverallStats, ReplayAggregate, RunAggregate, WaveStats};
pub use auth::{AuthConfig, AuthedClient, BearerAuth};
pub use client::{ClientOptions, LoadClient};
pub use config::{JourneyVariant, RunConfig, UidMode};
pub use error::{Error, Result};
pub use executor::{ReplayExecutor, StreamingReplayExecutor, WaveExecutor};
pub use journey::JourneyRunner;
pub use metric::{CompletionRecord, JourneyMetric, Metric, ReplayRecord};
pub use report::{JsonFileReporter, ReplayReport, Report, Reporter, RunReport, StdoutReporter};
pub use session::{SessionStore, SessionTokens};
pub use trace::TraceEvent;

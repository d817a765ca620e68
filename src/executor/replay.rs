//! Trace replay: reissue a recorded JSONL log against the target, scaled in
//! time by a speed factor, with per-user sessions rebuilt on the fly.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::aggregate::{Aggregate, ReplayAggregate};
use crate::client::{LoadClient, url_with};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::executor::{DRAIN_MARGIN, DispatchContext, spawn_workers};
use crate::metric::ReplayRecord;
use crate::session::SessionStore;
use crate::trace::{self, Endpoint, TraceEvent};

/// One scheduled trace event plus the offset the timer aimed for.
#[derive(Debug, Clone)]
pub(crate) struct EventWork {
    pub event: TraceEvent,
    pub scheduled_ms: i64,
}

/// Replays a trace file. The timing basis is cumulative `delayMs` divided
/// by the speed factor; absolute timestamps are only carried through for
/// reporting.
#[derive(TypedBuilder)]
pub struct ReplayExecutor {
    #[builder(setter(into))]
    pub trace_path: PathBuf,
    #[builder(default = 1.0)]
    pub speed: f64,
    /// Schedule and account for every event without touching the network.
    #[builder(default = false)]
    pub dry_run: bool,
    #[builder(default = 50)]
    pub prewarm_parallelism: usize,
    #[builder(default = false)]
    pub save_sessions: bool,
    #[builder(default = false)]
    pub load_sessions: bool,
    #[builder(default, setter(strip_option))]
    pub cancel: Option<watch::Receiver<bool>>,
}

impl ReplayExecutor {
    /// `sessions_<trace-stem>.json`, next to the working directory, same as
    /// the session cache the CLI flags refer to.
    pub fn sessions_path(&self) -> PathBuf {
        let stem = self
            .trace_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trace".into());
        PathBuf::from(format!("sessions_{stem}.json"))
    }

    pub async fn execute(
        &self,
        client: Arc<LoadClient>,
        config: Arc<RunConfig>,
    ) -> Result<ReplayAggregate> {
        if self.speed <= 0.0 {
            return Err(Error::Config("speed factor must be positive".into()));
        }

        // Phase 1: read the whole trace and find the users it touches.
        let events = trace::read_trace(&self.trace_path)?;
        if events.is_empty() {
            warn!("trace contains no events");
            return Ok(ReplayAggregate {
                source: self.trace_path.display().to_string(),
                speed: self.speed,
                ..ReplayAggregate::new()
            });
        }
        let users = trace::unique_users(&events);
        info!(events = events.len(), users = users.len(), "trace scanned");

        // Phase 2: sessions, from cache or by warming the store.
        let store = Arc::new(SessionStore::new(Arc::clone(&client), config.base()));
        if !self.dry_run && !users.is_empty() {
            self.prepare_sessions(&store, &config, &users).await?;
        }

        // Phase 3: size the pool for the worst 100 ms burst.
        let profile = trace::scan_bursts(events.iter().map(|e| e.delay_ms), self.speed);
        let pool = profile.pool_size();
        info!(
            peak_100ms = profile.peak_100ms,
            max_rps = profile.max_rps,
            pool,
            "worker pool sized from pre-scan"
        );

        let original_duration_ms: i64 = events.iter().map(|e| e.delay_ms.max(0)).sum();
        let scheduled_duration_ms = (original_duration_ms as f64 / self.speed) as i64;

        // Phase 4: schedule and fire.
        let (ctx, shutdown_tx) = DispatchContext::<EventWork>::new(events.len());
        let records: Arc<Mutex<Vec<ReplayRecord>>> =
            Arc::new(Mutex::new(Vec::with_capacity(events.len())));

        let replay_start = Instant::now();
        let handler = Arc::new(EventHandler {
            client,
            config: Arc::clone(&config),
            store,
            dry_run: self.dry_run,
            started: replay_start,
        });

        let workers = {
            let latch = Arc::clone(&ctx.latch);
            let records = Arc::clone(&records);
            spawn_workers(ctx.clone(), pool, move |work: EventWork| {
                let handler = Arc::clone(&handler);
                let latch = Arc::clone(&latch);
                let records = Arc::clone(&records);
                async move {
                    let index = work.event.index;
                    let scheduled_ms = work.scheduled_ms;
                    let endpoint = work.event.raw_endpoint.clone();
                    let uid = work.event.user_id.clone().unwrap_or_default();
                    let record = match std::panic::AssertUnwindSafe(handler.handle(work))
                        .catch_unwind()
                        .await
                    {
                        Ok(record) => record,
                        Err(_) => ReplayRecord {
                            index,
                            scheduled_ms,
                            actual_ms: scheduled_ms,
                            latency_ms: 0,
                            response_ms: scheduled_ms,
                            success: false,
                            endpoint,
                            user_id: uid,
                            error: "worker crashed".into(),
                        },
                    };
                    records.lock().expect("records poisoned").push(record);
                    latch.count_down();
                }
            })
        };

        let timer = {
            let queue = Arc::clone(&ctx.queue);
            let mut shutdown = ctx.shutdown.clone();
            let speed = self.speed;
            tokio::spawn(async move {
                let mut cumulative_ms: i64 = 0;
                for event in events {
                    cumulative_ms += event.delay_ms.max(0);
                    let scheduled_ms = (cumulative_ms as f64 / speed) as i64;
                    let target = replay_start + Duration::from_millis(scheduled_ms as u64);
                    tokio::select! {
                        _ = sleep_until(target) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            debug!(index = event.index, "replay dispatch cancelled");
                            return;
                        }
                    }
                    queue.push(EventWork { event, scheduled_ms });
                }
            })
        };

        let deadline = Duration::from_millis(scheduled_duration_ms.max(0) as u64) + DRAIN_MARGIN;
        let mut cancel = self.cancel.clone();
        let mut cancelled = false;
        let completed = tokio::select! {
            done = ctx.latch.wait_timeout(deadline) => done,
            _ = wait_for_cancel(&mut cancel) => {
                info!("cancel requested, stopping replay dispatch");
                cancelled = true;
                false
            }
        };

        let _ = shutdown_tx.send(true);
        ctx.queue.close();
        let _ = timer.await;
        if completed || cancelled {
            join_all(workers).await;
        } else {
            warn!(
                remaining = ctx.latch.remaining(),
                "replay latch timed out; abandoning in-flight work"
            );
            for worker in workers {
                worker.abort();
            }
        }

        let actual_duration_ms = replay_start.elapsed().as_millis() as i64;
        let mut aggregate = ReplayAggregate::new();
        for record in records.lock().expect("records poisoned").drain(..) {
            aggregate.consume(&record);
        }
        aggregate.source = self.trace_path.display().to_string();
        aggregate.speed = self.speed;
        aggregate.original_duration_ms = original_duration_ms;
        aggregate.scheduled_duration_ms = scheduled_duration_ms;
        aggregate.actual_duration_ms = actual_duration_ms;
        aggregate.partial = !completed;
        info!(
            total = aggregate.total_events,
            ok = aggregate.success_count,
            failed = aggregate.fail_count,
            "replay drained"
        );
        Ok(aggregate)
    }

    async fn prepare_sessions(
        &self,
        store: &Arc<SessionStore>,
        config: &RunConfig,
        users: &[String],
    ) -> Result<()> {
        prepare_sessions(
            store,
            config,
            users,
            &self.sessions_path(),
            self.load_sessions,
            self.save_sessions,
            self.prewarm_parallelism,
        )
        .await
    }
}

/// Load the session cache or warm the store for every user in the trace.
/// Shared by the in-memory and streaming replay paths.
pub(crate) async fn prepare_sessions(
    store: &Arc<SessionStore>,
    config: &RunConfig,
    users: &[String],
    sessions_path: &Path,
    load_sessions: bool,
    save_sessions: bool,
    parallelism: usize,
) -> Result<()> {
    if load_sessions && store.load_from_file(sessions_path, &config.puzzle_id).await? {
        info!(
            sessions = store.len().await,
            path = %sessions_path.display(),
            "loaded cached sessions"
        );
        return Ok(());
    }

    let keys: Vec<(String, String, String)> = users
        .iter()
        .map(|uid| (uid.clone(), config.puzzle_id.clone(), config.series.clone()))
        .collect();
    let (valid, failed) = store.bulk_warm(keys, parallelism).await;
    info!(valid, failed, "pre-warm finished");

    if save_sessions {
        let saved = store.save_to_file(sessions_path).await?;
        info!(saved, path = %sessions_path.display(), "sessions saved");
    }
    Ok(())
}

/// Per-endpoint replay logic shared by the in-memory and streaming
/// executors.
pub(crate) struct EventHandler {
    pub client: Arc<LoadClient>,
    pub config: Arc<RunConfig>,
    pub store: Arc<SessionStore>,
    pub dry_run: bool,
    pub started: Instant,
}

impl EventHandler {
    /// Execute one event end to end and produce its record. Never errors;
    /// failures land in the record's error string.
    pub async fn handle(&self, work: EventWork) -> ReplayRecord {
        let actual_ms = self.started.elapsed().as_millis() as i64;
        let event = &work.event;
        let uid = event.user_id.clone().unwrap_or_default();

        if self.dry_run {
            debug!(endpoint = %event.raw_endpoint, uid = %uid, "[dry-run] skipped");
            return ReplayRecord {
                index: event.index,
                scheduled_ms: work.scheduled_ms,
                actual_ms,
                latency_ms: 0,
                response_ms: actual_ms,
                success: true,
                endpoint: event.raw_endpoint.clone(),
                user_id: uid,
                error: String::new(),
            };
        }

        let fired = Instant::now();
        let outcome = self.fire(event, &uid).await;
        let latency_ms = fired.elapsed().as_millis() as i64;

        let (success, error) = match outcome {
            Ok(note) => (true, note.unwrap_or_default()),
            Err(e) => {
                debug!(endpoint = %event.raw_endpoint, uid = %uid, error = %e, "event failed");
                (false, e.to_string())
            }
        };

        ReplayRecord {
            index: event.index,
            scheduled_ms: work.scheduled_ms,
            actual_ms,
            latency_ms,
            response_ms: actual_ms + latency_ms,
            success,
            endpoint: event.raw_endpoint.clone(),
            user_id: uid,
            error,
        }
    }

    /// Dispatch on the closed endpoint sum. The `Ok` note carries
    /// non-fatal observations (unknown endpoint).
    async fn fire(&self, event: &TraceEvent, uid: &str) -> Result<Option<String>> {
        let series = event.series.as_deref().unwrap_or(&self.config.series);
        let puzzle = event.puzzle_id.as_deref().unwrap_or(&self.config.puzzle_id);
        match event.endpoint {
            Endpoint::DatePicker => {
                let url = url_with(&self.config.base(), "date-picker", &[("set", series), ("uid", uid)])?;
                self.client.get_discard(url).await?;
                Ok(None)
            }
            Endpoint::PickerStatus => {
                let session = self.session_for(uid, puzzle, series).await?;
                let url = url_with(&self.config.base(), "postPickerStatus", &[])?;
                let payload = json!({
                    "loadToken": session.load_token,
                    "isVerified": true,
                    "adDuration": 0,
                    "reason": "displaying puzzle picker",
                });
                self.client.post_json(url, &payload).await?;
                Ok(None)
            }
            Endpoint::Crossword => {
                // A missing session degrades to an anonymous page load
                // rather than failing the event.
                let token = self.store.get_or_create(uid, puzzle, series).await;
                let load_token = if token.is_valid() { token.load_token } else { String::new() };
                let src = format!("{}date-picker?set={}&uid={}", self.config.base(), series, uid);
                let url = url_with(
                    &self.config.base(),
                    "crossword",
                    &[
                        ("id", puzzle),
                        ("set", series),
                        ("picker", "date-picker"),
                        ("src", &src),
                        ("uid", uid),
                        ("loadToken", &load_token),
                    ],
                )?;
                self.client.get_discard(url).await?;
                Ok(None)
            }
            Endpoint::Plays => {
                let session = self.session_for(uid, puzzle, series).await?;
                let url = url_with(&self.config.base(), "api/v1/plays", &[])?;
                let payload = self.replay_play_payload(&session.load_token, &session.play_id, uid, puzzle, series);
                self.client.post_json(url, &payload).await?;
                Ok(None)
            }
            Endpoint::Puzzles => {
                let url = url_with(&self.config.base(), "api/v1/puzzles", &[("set", series)])?;
                self.client.get_discard(url).await?;
                Ok(None)
            }
            Endpoint::Unknown => {
                debug!(endpoint = %event.raw_endpoint, "unknown endpoint");
                Ok(Some(format!("unknown endpoint {}", event.raw_endpoint)))
            }
        }
    }

    async fn session_for(
        &self,
        uid: &str,
        puzzle: &str,
        series: &str,
    ) -> Result<crate::session::SessionTokens> {
        let tokens = self.store.get_or_create(uid, puzzle, series).await;
        if tokens.is_valid() {
            Ok(tokens)
        } else {
            Err(Error::SessionUnavailable {
                uid: uid.to_string(),
                reason: tokens.error.unwrap_or_else(|| "no load token".into()),
            })
        }
    }

    fn replay_play_payload(
        &self,
        load_token: &str,
        play_id: &str,
        uid: &str,
        puzzle: &str,
        series: &str,
    ) -> serde_json::Value {
        let ts = crate::metric::now_ms();
        let (primary, secondary) = {
            let mut rng = rand::thread_rng();
            (random_digits(&mut rng, 15), random_digits(&mut rng, 15))
        };
        json!({
            "loadToken": load_token,
            "updatePlayTable": true,
            "updateLoadTable": false,
            "series": series,
            "id": puzzle,
            "playId": play_id,
            "userId": uid,
            "browser": crate::client::USER_AGENT,
            "streakLength": 0,
            "getProgressFromBackend": true,
            "fromPicker": "date-picker",
            "inContestMode": false,
            "timestamp": ts,
            "updatedTimestamp": ts,
            "playState": 2,
            "timeTaken": 10,
            "score": 0,
            "timeOnPage": 5000,
            "nPrints": 0,
            "nPrintsEmpty": 0,
            "nPrintsFilled": 0,
            "nPrintsSol": 0,
            "nClearClicks": 0,
            "nSettingsClicks": 0,
            "nHelpClicks": 0,
            "nResizes": 0,
            "nExceptions": 0,
            "postScoreReason": "AUTOSAVE",
            "primaryState": primary,
            "secondaryState": secondary,
        })
    }
}

fn random_digits(rng: &mut impl Rng, len: usize) -> String {
    (0..len).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect()
}

async fn wait_for_cancel(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;

    #[test]
    fn sessions_path_derives_from_trace_stem() {
        let executor = ReplayExecutor::builder()
            .trace_path("/data/traffic_final_10min.jsonl")
            .build();
        assert_eq!(executor.sessions_path(), PathBuf::from("sessions_traffic_final_10min.json"));
    }

    #[test]
    fn replay_states_are_digit_strings() {
        let mut rng = rand::thread_rng();
        let digits = random_digits(&mut rng, 15);
        assert_eq!(digits.len(), 15);
        assert!(digits.bytes().all(|b| b.is_ascii_digit()));
    }

    #[tokio::test]
    async fn non_positive_speed_is_rejected() {
        let client = Arc::new(LoadClient::new(ClientOptions::default()).unwrap());
        let config = Arc::new(RunConfig::builder().build());
        let executor = ReplayExecutor::builder()
            .trace_path("/nonexistent.jsonl")
            .speed(0.0)
            .build();
        assert!(matches!(executor.execute(client, config).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn missing_trace_file_is_fatal() {
        let client = Arc::new(LoadClient::new(ClientOptions::default()).unwrap());
        let config = Arc::new(RunConfig::builder().build());
        let executor = ReplayExecutor::builder().trace_path("/nonexistent.jsonl").build();
        assert!(matches!(
            executor.execute(client, config).await,
            Err(Error::TraceUnavailable(_))
        ));
    }
}

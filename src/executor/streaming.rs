//! Streaming replay for traces too large to hold in memory.
//!
//! Two passes over the file. The pre-scan pass counts events, collects the
//! unique users, and builds the 100 ms burst histogram that sizes the
//! worker pool; nothing is retained per event. The replay pass parses and
//! schedules line by line — dispatch ordering holds because cumulative
//! delays are monotonically non-decreasing. Aggregate counters stay exact;
//! per-event detail and the latency vector are reservoir-sampled to fixed
//! caps.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use rand::Rng;
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::aggregate::ReplayAggregate;
use crate::client::LoadClient;
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::executor::replay::{EventHandler, EventWork, prepare_sessions};
use crate::executor::{DRAIN_MARGIN, DispatchContext, spawn_workers};
use crate::metric::ReplayRecord;
use crate::session::SessionStore;
use crate::trace::{self, BurstScanner};

/// Cap on retained per-event detail records.
pub const DETAIL_SAMPLE_CAP: usize = 500;
/// Cap on retained latency samples for percentiles.
pub const LATENCY_SAMPLE_CAP: usize = 10_000;

/// Uniform sample over a stream of unknown length: item `i` replaces a
/// random slot with probability `cap / (i + 1)`.
struct Reservoir<T> {
    cap: usize,
    seen: usize,
    items: Vec<T>,
}

impl<T> Reservoir<T> {
    fn new(cap: usize) -> Self {
        Reservoir { cap, seen: 0, items: Vec::with_capacity(cap.min(1024)) }
    }

    fn push(&mut self, item: T, rng: &mut impl Rng) {
        if self.items.len() < self.cap {
            self.items.push(item);
        } else {
            let slot = rng.gen_range(0..=self.seen);
            if slot < self.cap {
                self.items[slot] = item;
            }
        }
        self.seen += 1;
    }

    fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Exact counters plus sampled detail, shared by all workers.
struct Collector {
    total: AtomicUsize,
    success: AtomicUsize,
    failed: AtomicUsize,
    total_latency_ms: AtomicI64,
    detail: Mutex<Reservoir<ReplayRecord>>,
    latencies: Mutex<Reservoir<i64>>,
}

impl Collector {
    fn new(detail_cap: usize, latency_cap: usize) -> Self {
        Collector {
            total: AtomicUsize::new(0),
            success: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            total_latency_ms: AtomicI64::new(0),
            detail: Mutex::new(Reservoir::new(detail_cap)),
            latencies: Mutex::new(Reservoir::new(latency_cap)),
        }
    }

    fn consume(&self, record: ReplayRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if record.success {
            self.success.fetch_add(1, Ordering::Relaxed);
            self.total_latency_ms.fetch_add(record.latency_ms, Ordering::Relaxed);
            let mut rng = rand::thread_rng();
            self.latencies.lock().expect("latencies poisoned").push(record.latency_ms, &mut rng);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut rng = rand::thread_rng();
        self.detail.lock().expect("detail poisoned").push(record, &mut rng);
    }
}

/// Line-at-a-time replay with bounded memory.
#[derive(TypedBuilder)]
pub struct StreamingReplayExecutor {
    #[builder(setter(into))]
    pub trace_path: PathBuf,
    #[builder(default = 1.0)]
    pub speed: f64,
    #[builder(default = false)]
    pub dry_run: bool,
    #[builder(default = 50)]
    pub prewarm_parallelism: usize,
    #[builder(default = false)]
    pub save_sessions: bool,
    #[builder(default = false)]
    pub load_sessions: bool,
    #[builder(default = DETAIL_SAMPLE_CAP)]
    pub detail_sample_cap: usize,
    #[builder(default = LATENCY_SAMPLE_CAP)]
    pub latency_sample_cap: usize,
    #[builder(default, setter(strip_option))]
    pub cancel: Option<watch::Receiver<bool>>,
}

/// What the pre-scan pass learned without retaining events.
struct PreScan {
    events: usize,
    users: Vec<String>,
    total_delay_ms: i64,
    profile: trace::BurstProfile,
}

impl StreamingReplayExecutor {
    pub fn sessions_path(&self) -> PathBuf {
        let stem = self
            .trace_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "trace".into());
        PathBuf::from(format!("sessions_{stem}.json"))
    }

    async fn pre_scan(&self) -> Result<PreScan> {
        let file = tokio::fs::File::open(&self.trace_path)
            .await
            .map_err(|_| Error::TraceUnavailable(self.trace_path.clone()))?;
        let mut lines = tokio::io::BufReader::new(file).lines();

        let mut scanner = BurstScanner::new(self.speed);
        let mut seen_users = std::collections::HashSet::new();
        let mut users = Vec::new();
        let mut events = 0usize;
        let mut total_delay_ms = 0i64;
        let mut line_num = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_num += 1;
            let Some(event) = trace::parse_line(&line, events) else { continue };
            scanner.push(event.delay_ms);
            total_delay_ms += event.delay_ms.max(0);
            if let Some(uid) = event.user_id {
                if seen_users.insert(uid.clone()) {
                    users.push(uid);
                }
            }
            events += 1;
            if line_num % 100_000 == 0 {
                info!(line_num, events, "pre-scan progress");
            }
        }

        Ok(PreScan { events, users, total_delay_ms, profile: scanner.finish() })
    }

    pub async fn execute(
        &self,
        client: Arc<LoadClient>,
        config: Arc<RunConfig>,
    ) -> Result<ReplayAggregate> {
        if self.speed <= 0.0 {
            return Err(Error::Config("speed factor must be positive".into()));
        }

        let scan = self.pre_scan().await?;
        if scan.events == 0 {
            warn!("trace contains no events");
            return Ok(ReplayAggregate {
                source: self.trace_path.display().to_string(),
                speed: self.speed,
                ..ReplayAggregate::default()
            });
        }
        let pool = scan.profile.pool_size();
        info!(
            events = scan.events,
            users = scan.users.len(),
            peak_100ms = scan.profile.peak_100ms,
            pool,
            "pre-scan complete"
        );

        let store = Arc::new(SessionStore::new(Arc::clone(&client), config.base()));
        if !self.dry_run && !scan.users.is_empty() {
            prepare_sessions(
                &store,
                &config,
                &scan.users,
                &self.sessions_path(),
                self.load_sessions,
                self.save_sessions,
                self.prewarm_parallelism,
            )
            .await?;
        }

        let scheduled_duration_ms = (scan.total_delay_ms as f64 / self.speed) as i64;
        let (ctx, shutdown_tx) = DispatchContext::<EventWork>::new(scan.events);
        let collector = Arc::new(Collector::new(self.detail_sample_cap, self.latency_sample_cap));

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
            let collector = Arc::clone(&collector);
            spawn_workers(ctx.clone(), pool, move |work: EventWork| {
                let handler = Arc::clone(&handler);
                let latch = Arc::clone(&latch);
                let collector = Arc::clone(&collector);
                async move {
                    let index = work.event.index;
                    let scheduled_ms = work.scheduled_ms;
                    let endpoint = work.event.raw_endpoint.clone();
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
                            user_id: String::new(),
                            error: "worker crashed".into(),
                        },
                    };
                    collector.consume(record);
                    latch.count_down();
                }
            })
        };

        // The reader loop is the timer: parse a line, sleep to its offset,
        // hand off, move on. No I/O beyond the file read happens here.
        let timer = {
            let queue = Arc::clone(&ctx.queue);
            let mut shutdown = ctx.shutdown.clone();
            let path = self.trace_path.clone();
            let speed = self.speed;
            tokio::spawn(async move {
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(error = %e, "trace disappeared between passes");
                        return;
                    }
                };
                let mut lines = tokio::io::BufReader::new(file).lines();
                let mut cumulative_ms = 0i64;
                let mut index = 0usize;
                while let Ok(Some(line)) = lines.next_line().await {
                    let Some(event) = trace::parse_line(&line, index) else { continue };
                    cumulative_ms += event.delay_ms.max(0);
                    let scheduled_ms = (cumulative_ms as f64 / speed) as i64;
                    let target = replay_start + Duration::from_millis(scheduled_ms as u64);
                    tokio::select! {
                        _ = sleep_until(target) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            debug!(index, "streaming dispatch cancelled");
                            return;
                        }
                    }
                    queue.push(EventWork { event, scheduled_ms });
                    index += 1;
                }
            })
        };

        let deadline = Duration::from_millis(scheduled_duration_ms.max(0) as u64) + DRAIN_MARGIN;
        let mut cancel = self.cancel.clone();
        let mut cancelled = false;
        let completed = tokio::select! {
            done = ctx.latch.wait_timeout(deadline) => done,
            _ = wait_for_cancel(&mut cancel) => {
                info!("cancel requested, stopping streaming replay");
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
            warn!(remaining = ctx.latch.remaining(), "streaming latch timed out");
            for worker in workers {
                worker.abort();
            }
        }

        // Abandoned workers may still hold a collector handle briefly, so
        // the samples are taken out from under the shared Arc.
        let latency_samples = std::mem::replace(
            &mut *collector.latencies.lock().expect("latencies poisoned"),
            Reservoir::new(0),
        )
        .into_items();
        let detail = std::mem::replace(
            &mut *collector.detail.lock().expect("detail poisoned"),
            Reservoir::new(0),
        )
        .into_items();
        let aggregate = ReplayAggregate {
            source: self.trace_path.display().to_string(),
            speed: self.speed,
            original_duration_ms: scan.total_delay_ms,
            scheduled_duration_ms,
            actual_duration_ms: replay_start.elapsed().as_millis() as i64,
            total_events: collector.total.load(Ordering::Relaxed),
            success_count: collector.success.load(Ordering::Relaxed),
            fail_count: collector.failed.load(Ordering::Relaxed),
            total_latency_ms: collector.total_latency_ms.load(Ordering::Relaxed),
            latency_samples,
            partial: !completed,
            records: detail,
        };
        info!(
            total = aggregate.total_events,
            ok = aggregate.success_count,
            failed = aggregate.fail_count,
            sampled = aggregate.records.len(),
            "streaming replay drained"
        );
        Ok(aggregate)
    }
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

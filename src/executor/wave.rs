//! Synthetic wave mode: `rps` journeys launched every second for `duration`
//! seconds, whether or not earlier waves have finished.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

use crate::aggregate::RunAggregate;
use crate::client::LoadClient;
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::executor::{DRAIN_MARGIN, DispatchContext, spawn_workers};
use crate::journey::JourneyRunner;
use crate::metric::{CompletionRecord, now_ms};

/// One queued journey invocation.
#[derive(Debug, Clone, Copy)]
struct WaveWork {
    wave: u32,
    thread: u32,
}

/// Wave-mode scheduler and worker pool.
///
/// Wave *w* launches at `T0 + (w-1)·1s` from a dedicated timer task that
/// only enqueues work; a pool of `rps × workers_per_rps` journey workers
/// services the queue so overlapping waves all make progress.
#[derive(TypedBuilder)]
pub struct WaveExecutor {
    pub rps: usize,
    pub duration: usize,
    #[builder(default = "wave run".into(), setter(into))]
    pub title: String,
    /// Pool sizing factor; 8 leaves headroom for journeys spanning several
    /// waves.
    #[builder(default = 8)]
    pub workers_per_rps: usize,
    /// External cancel signal: flips to `true` to stop further dispatch.
    #[builder(default, setter(strip_option))]
    pub cancel: Option<watch::Receiver<bool>>,
}

impl WaveExecutor {
    pub async fn execute(
        &self,
        client: Arc<LoadClient>,
        config: Arc<RunConfig>,
    ) -> Result<RunAggregate> {
        if self.rps == 0 || self.duration == 0 {
            return Err(Error::Config("rps and duration must both be positive".into()));
        }
        let total = self.rps * self.duration;
        info!(rps = self.rps, duration = self.duration, total, "starting wave run");

        let (ctx, shutdown_tx) = DispatchContext::<WaveWork>::new(total);
        let records: Arc<Mutex<Vec<CompletionRecord>>> =
            Arc::new(Mutex::new(Vec::with_capacity(total)));
        let runner = JourneyRunner::new(client, Arc::clone(&config));

        // Floor of one worker per core, so low-rps runs still overlap
        // journeys across waves.
        let pool = (self.rps * self.workers_per_rps).max(num_cpus::get());
        let workers = {
            let latch = Arc::clone(&ctx.latch);
            let records = Arc::clone(&records);
            spawn_workers(ctx.clone(), pool, move |work: WaveWork| {
                let runner = runner.clone();
                let latch = Arc::clone(&latch);
                let records = Arc::clone(&records);
                async move {
                    let launch_time = now_ms();
                    let record = match std::panic::AssertUnwindSafe(runner.run())
                        .catch_unwind()
                        .await
                    {
                        Ok(journey) => CompletionRecord {
                            wave: work.wave,
                            thread: work.thread,
                            launch_time,
                            completion_time: now_ms(),
                            result: Some(journey),
                            error: None,
                        },
                        Err(panic) => CompletionRecord {
                            wave: work.wave,
                            thread: work.thread,
                            launch_time,
                            completion_time: now_ms(),
                            result: None,
                            error: Some(panic_message(panic)),
                        },
                    };
                    records.lock().expect("records poisoned").push(record);
                    latch.count_down();
                }
            })
        };

        let overall_start = Instant::now();
        let timer = {
            let queue = Arc::clone(&ctx.queue);
            let mut shutdown = ctx.shutdown.clone();
            let rps = self.rps;
            let duration = self.duration;
            tokio::spawn(async move {
                let mut next_tick = Instant::now();
                for wave in 1..=duration as u32 {
                    if wave > 1 {
                        next_tick += Duration::from_secs(1);
                        tokio::select! {
                            _ = sleep_until(next_tick) => {}
                            _ = shutdown.wait_for(|stop| *stop) => {
                                debug!(wave, "dispatch cancelled");
                                return;
                            }
                        }
                    }
                    debug!(wave, threads = rps, "launching wave");
                    for thread in 0..rps as u32 {
                        queue.push(WaveWork { wave, thread });
                    }
                }
            })
        };

        let scheduled = Duration::from_secs(self.duration as u64);
        let mut cancel = self.cancel.clone();
        let mut cancelled = false;
        let completed = tokio::select! {
            done = ctx.latch.wait_timeout(scheduled + DRAIN_MARGIN) => done,
            _ = wait_for_cancel(&mut cancel) => {
                info!("cancel requested, stopping dispatch");
                cancelled = true;
                false
            }
        };

        let _ = shutdown_tx.send(true);
        ctx.queue.close();
        let _ = timer.await;

        if completed || cancelled {
            // In-flight journeys run out naturally; workers exit right after.
            join_all(workers).await;
        } else {
            warn!(
                remaining = ctx.latch.remaining(),
                "latch timed out; abandoning in-flight work"
            );
            for worker in workers {
                worker.abort();
            }
        }

        let total_time_ms = overall_start.elapsed().as_secs_f64() * 1000.0;
        let records = std::mem::take(&mut *records.lock().expect("records poisoned"));
        info!(collected = records.len(), total_time_ms, "wave run drained");

        Ok(RunAggregate {
            title: self.title.clone(),
            rps: self.rps,
            duration: self.duration,
            puzzle_id: config.puzzle_id.clone(),
            state_len: config.state_len,
            total_time_ms,
            partial: !completed,
            records,
        })
    }
}

async fn wait_for_cancel(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            // A dropped sender means cancel can never fire; park forever.
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("worker crashed: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("worker crashed: {msg}")
    } else {
        "worker crashed".into()
    }
}

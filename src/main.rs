use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridstorm::auth::{AuthConfig, AuthedClient};
use gridstorm::config::{JourneyVariant, UidMode, generate_uid_pool};
use gridstorm::report::{JsonFileReporter, ReplayReport, Reporter, RunReport, StdoutReporter};
use gridstorm::{
    ClientOptions, LoadClient, ReplayExecutor, RunConfig, StreamingReplayExecutor, WaveExecutor,
};

/// Load generation and traffic replay for the crossword puzzle service.
#[derive(Parser, Debug)]
#[command(name = "gridstorm", version, about)]
struct Args {
    /// Journeys launched per second (wave mode).
    #[arg(long)]
    rps: Option<usize>,
    /// Seconds of wave launches (wave mode).
    #[arg(long)]
    duration: Option<usize>,

    /// Replay this JSONL trace instead of generating waves.
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,
    /// Replay speed factor (2.0 = twice as fast).
    #[arg(long, default_value_t = 1.0)]
    speed: f64,
    /// Stream the trace line by line instead of loading it into memory.
    #[arg(long)]
    streaming: bool,
    /// Schedule everything but send nothing.
    #[arg(long)]
    dry_run: bool,

    /// Fixed virtual-user id.
    #[arg(long, conflicts_with_all = ["random_uid", "uid_pool_size"])]
    uid: Option<String>,
    /// Fresh random uid per journey.
    #[arg(long, conflicts_with = "uid_pool_size")]
    random_uid: bool,
    /// Draw uids from a pre-generated pool of this size.
    #[arg(long, value_name = "N")]
    uid_pool_size: Option<usize>,

    /// Session pre-warm parallelism.
    #[arg(long, default_value_t = 50)]
    parallel: usize,
    /// Pre-warm sessions and save them next to the trace.
    #[arg(long)]
    save_sessions: bool,
    /// Load previously saved sessions instead of pre-warming.
    #[arg(long)]
    load_sessions: bool,

    /// Report title.
    #[arg(long, default_value = "gridstorm run")]
    title: String,
    /// Write the full results tree (for the report renderers) here.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    series: Option<String>,
    #[arg(long)]
    puzzle: Option<String>,
    #[arg(long)]
    state_len: Option<usize>,
    /// Also fetch the pages' static assets during journeys.
    #[arg(long)]
    assets: bool,
    /// Trust any TLS certificate (self-signed test targets only).
    #[arg(long)]
    insecure: bool,
    /// JSON file with OAuth2 client credentials for authenticated tenants.
    #[arg(long, value_name = "FILE")]
    auth_config: Option<PathBuf>,

    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::builder().build();
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(series) = &self.series {
            config.series = series.clone();
        }
        if let Some(puzzle) = &self.puzzle {
            config.puzzle_id = puzzle.clone();
        }
        if let Some(state_len) = self.state_len {
            config.state_len = state_len;
        }
        if let Some(uid) = &self.uid {
            config.uid = uid.clone();
        }
        config.uid_mode = if let Some(n) = self.uid_pool_size {
            UidMode::Pool(generate_uid_pool(n))
        } else if self.random_uid {
            UidMode::Random
        } else {
            UidMode::Fixed
        };
        if self.assets {
            config.variant = JourneyVariant::WithStaticAssets;
        }
        config.insecure_tls = self.insecure;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("gridstorm={level}"))),
        )
        .init();

    let config = Arc::new(args.run_config());
    let client = Arc::new(LoadClient::new(
        ClientOptions::builder()
            .timeout(config.timeout)
            .insecure_tls(config.insecure_tls)
            .build(),
    )?);

    // Authenticated tenants refuse everything without a bearer token, so a
    // failed bootstrap aborts the run before any load is offered.
    if let Some(path) = &args.auth_config {
        let credentials = AuthConfig::from_file(path)?;
        let authed = AuthedClient::new(Arc::clone(&client), config.base(), credentials);
        authed.bootstrap().await?;
        info!("auth token bootstrap succeeded");
    }

    // Ctrl-C stops dispatch and drains what's in flight.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    if let Some(trace_path) = &args.replay {
        let aggregate = if args.streaming {
            StreamingReplayExecutor::builder()
                .trace_path(trace_path.clone())
                .speed(args.speed)
                .dry_run(args.dry_run)
                .prewarm_parallelism(args.parallel)
                .save_sessions(args.save_sessions)
                .load_sessions(args.load_sessions)
                .cancel(cancel_rx)
                .build()
                .execute(client, config)
                .await?
        } else {
            ReplayExecutor::builder()
                .trace_path(trace_path.clone())
                .speed(args.speed)
                .dry_run(args.dry_run)
                .prewarm_parallelism(args.parallel)
                .save_sessions(args.save_sessions)
                .load_sessions(args.load_sessions)
                .cancel(cancel_rx)
                .build()
                .execute(client, config)
                .await?
        };

        let partial = aggregate.partial;
        let report = ReplayReport::from(aggregate);
        StdoutReporter.report(&report).await?;
        if let Some(path) = &args.output {
            JsonFileReporter::new(path.clone()).report(&report).await?;
        }
        if partial {
            bail!("replay did not drain before the terminal barrier");
        }
    } else {
        let rps = args.rps.context("wave mode needs --rps (or pass --replay FILE)")?;
        let duration = args.duration.context("wave mode needs --duration")?;

        let aggregate = WaveExecutor::builder()
            .rps(rps)
            .duration(duration)
            .title(args.title.clone())
            .cancel(cancel_rx)
            .build()
            .execute(client, config)
            .await?;

        let partial = aggregate.partial;
        let report = RunReport::from(aggregate);
        StdoutReporter.report(&report).await?;
        if let Some(path) = &args.output {
            JsonFileReporter::new(path.clone()).report(&report).await?;
        }
        if partial {
            bail!("wave run did not drain before the terminal barrier");
        }
    }

    Ok(())
}

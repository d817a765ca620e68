//! Scheduler-facing scenarios: wave launch timing, replay offsets and
//! ordering, and the replay endpoint dispatch against a mock target.

mod common;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use wiremock::MockServer;

use gridstorm::{
    ClientOptions, LoadClient, ReplayExecutor, RunConfig, RunReport, StreamingReplayExecutor,
    WaveExecutor,
};

/// Generous jitter bound; CI hosts are noisy.
const EPSILON_MS: i64 = 150;

fn test_client() -> Arc<LoadClient> {
    Arc::new(LoadClient::new(ClientOptions::default()).expect("client"))
}

fn test_config(server: &MockServer) -> Arc<RunConfig> {
    Arc::new(RunConfig::builder().base_url(format!("{}/", server.uri())).build())
}

fn write_trace(name: &str, lines: &[&str]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gridstorm-{}-{}.jsonl", name, std::process::id()));
    let mut file = std::fs::File::create(&path).expect("trace file");
    for line in lines {
        writeln!(file, "{line}").expect("write line");
    }
    path
}

#[tokio::test]
async fn wave_3x2_launches_a_second_apart() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;

    let executor = WaveExecutor::builder().rps(3).duration(2).title("3x2").build();
    let aggregate = executor
        .execute(test_client(), test_config(&server))
        .await
        .expect("execute");

    assert_eq!(aggregate.records.len(), 6);
    assert!(!aggregate.partial);

    let launch_of = |wave: u32| {
        aggregate
            .records
            .iter()
            .filter(|r| r.wave == wave)
            .map(|r| r.launch_time)
            .min()
            .expect("wave present")
    };
    let spacing = launch_of(2) - launch_of(1);
    assert!(
        (spacing - 1000).abs() <= EPSILON_MS,
        "waves {spacing} ms apart, expected ~1000"
    );

    let report = RunReport::from(aggregate);
    assert_eq!(report.waves.len(), 2);
    for wave in &report.waves {
        assert_eq!(wave.threads, 3);
        assert_eq!(wave.success, 3);
        assert_eq!(wave.failed, 0);
        assert!(wave.avg > 0.0);
    }
    assert_eq!(report.overall.total_threads, 6);
    assert_eq!(report.config.total_threads, 6);
}

#[tokio::test]
async fn replay_at_2x_halves_the_offsets() {
    let path = write_trace(
        "speed",
        &[
            r#"{"ts": 0, "endpoint": "/date-picker", "delayMs": 0}"#,
            r#"{"ts": 1000, "endpoint": "/date-picker", "delayMs": 1000}"#,
            r#"{"ts": 2500, "endpoint": "/date-picker", "delayMs": 1500}"#,
        ],
    );

    // Dry-run keeps the full schedule without needing a live target.
    let executor = ReplayExecutor::builder().trace_path(&path).speed(2.0).dry_run(true).build();
    let config = Arc::new(RunConfig::builder().build());
    let aggregate = executor.execute(test_client(), config).await.expect("execute");
    std::fs::remove_file(&path).ok();

    assert_eq!(aggregate.total_events, 3);
    assert_eq!(aggregate.success_count, 3);
    assert!(!aggregate.partial);
    assert_eq!(aggregate.original_duration_ms, 2500);
    assert_eq!(aggregate.scheduled_duration_ms, 1250);

    let mut records = aggregate.records.clone();
    records.sort_by_key(|r| r.index);
    let expected = [0i64, 500, 1250];
    for (record, want) in records.iter().zip(expected) {
        assert_eq!(record.scheduled_ms, want);
        assert!(
            (record.actual_ms - want).abs() <= EPSILON_MS,
            "event {} dispatched at {} ms, wanted ~{} ms",
            record.index,
            record.actual_ms,
            want
        );
    }

    // Dispatch order follows the trace order.
    for pair in records.windows(2) {
        assert!(pair[0].actual_ms <= pair[1].actual_ms + EPSILON_MS);
    }
}

#[tokio::test]
async fn replay_reissues_known_endpoints_and_records_unknown_ones() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;

    let path = write_trace(
        "dispatch",
        &[
            r#"{"ts": 0, "endpoint": "/date-picker", "delayMs": 0, "userId": "u1"}"#,
            r#"{"ts": 5, "endpoint": "/api/v1/plays", "delayMs": 5, "userId": "u1", "method": "POST"}"#,
            r#"{"ts": 10, "endpoint": "/crossword", "delayMs": 5, "userId": "u2"}"#,
            r#"{"ts": 15, "endpoint": "/telemetry", "delayMs": 5, "userId": "u1", "method": "POST"}"#,
            "this line is not json and must be skipped",
        ],
    );

    let executor = ReplayExecutor::builder().trace_path(&path).prewarm_parallelism(4).build();
    let aggregate = executor
        .execute(test_client(), test_config(&server))
        .await
        .expect("execute");
    std::fs::remove_file(&path).ok();

    // Four parseable events; the malformed line vanished silently.
    assert_eq!(aggregate.total_events, 4);
    assert_eq!(aggregate.fail_count, 0);

    let unknown: Vec<_> = aggregate
        .records
        .iter()
        .filter(|r| r.endpoint == "/telemetry")
        .collect();
    assert_eq!(unknown.len(), 1);
    assert!(unknown[0].success);
    assert!(unknown[0].error.contains("unknown endpoint"));

    // Two users were pre-warmed (one date-picker + crossword each), and the
    // replayed date-picker hit makes a third GET.
    assert_eq!(common::requests_for(&server, "GET", "/date-picker").await.len(), 3);
    assert_eq!(common::requests_for(&server, "GET", "/crossword").await.len(), 3);
    // The replayed play post went out with the warmed session.
    let plays = common::requests_for(&server, "POST", "/api/v1/plays").await;
    assert_eq!(plays.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&plays[0].body).unwrap();
    assert_eq!(body["loadToken"], common::LOAD_TOKEN);
    assert_eq!(body["postScoreReason"], "AUTOSAVE");
}

#[tokio::test]
async fn streaming_replay_matches_the_in_memory_counters() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;

    let lines: Vec<String> = (0..40)
        .map(|i| {
            format!(
                r#"{{"ts": {}, "endpoint": "/crossword", "delayMs": 5, "userId": "u{}"}}"#,
                i * 5,
                i % 4
            )
        })
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let path = write_trace("streaming", &refs);

    let executor = StreamingReplayExecutor::builder()
        .trace_path(&path)
        .speed(4.0)
        .prewarm_parallelism(4)
        .detail_sample_cap(10)
        .build();
    let aggregate = executor
        .execute(test_client(), test_config(&server))
        .await
        .expect("execute");
    std::fs::remove_file(&path).ok();

    // Counters are exact even though detail is sampled down.
    assert_eq!(aggregate.total_events, 40);
    assert_eq!(aggregate.success_count, 40);
    assert_eq!(aggregate.fail_count, 0);
    assert!(!aggregate.partial);
    assert_eq!(aggregate.records.len(), 10);
    assert!(aggregate.latency_samples.len() == 40);
}

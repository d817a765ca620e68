//! End-to-end journey behavior against a mock target: the happy path, the
//! single-flight session store, failure attribution, and the authenticated
//! client's retry.

mod common;

use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gridstorm::auth::{AuthConfig, AuthedClient};
use gridstorm::{
    ClientOptions, JourneyRunner, LoadClient, RunConfig, SessionStore, WaveExecutor,
};

fn test_client() -> Arc<LoadClient> {
    Arc::new(LoadClient::new(ClientOptions::default()).expect("client"))
}

fn test_config(server: &MockServer) -> Arc<RunConfig> {
    Arc::new(
        RunConfig::builder()
            .base_url(format!("{}/", server.uri()))
            .uid("vansh")
            .puzzle_id("d4725144")
            .state_len(185)
            .build(),
    )
}

#[tokio::test]
async fn single_journey_fixed_uid_succeeds() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;

    let runner = JourneyRunner::new(test_client(), test_config(&server));
    let journey = runner.run().await;

    assert!(journey.success, "journey failed: {:?}", journey.error);
    let step1 = journey.step1.clone().expect("step1");
    let step2 = journey.step2.clone().expect("step2");
    let step3 = journey.step3.clone().expect("step3");
    let step4 = journey.step4.clone().expect("step4");

    assert_eq!(step1.uid.as_deref(), Some("vansh"));
    assert!(step1.success && step2.success && step3.success && step4.success);

    // Steps run strictly in order.
    assert!(step1.end_timestamp <= step2.start_timestamp);
    assert!(step2.end_timestamp <= step3.start_timestamp);
    assert!(step3.end_timestamp <= step4.start_timestamp);

    // Exactly ten iterations with the fixed play-state sequence.
    assert_eq!(step4.iterations.len(), 10);
    let states: Vec<u8> = step4.iterations.iter().map(|it| it.play_state).collect();
    assert_eq!(states, [1, 2, 2, 2, 2, 2, 2, 2, 2, 4]);
    for (i, iteration) in step4.iterations.iter().enumerate() {
        assert_eq!(iteration.iteration as usize, i + 1);
    }

    assert!(journey.total_latency_ms() > 0.0);
}

#[tokio::test]
async fn play_payloads_keep_the_state_vector_shape() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;

    let config = Arc::new(
        RunConfig::builder()
            .base_url(format!("{}/", server.uri()))
            .state_len(42)
            .build(),
    );
    let journey = JourneyRunner::new(test_client(), config).run().await;
    assert!(journey.success);

    let plays = common::requests_for(&server, "POST", "/api/v1/plays").await;
    assert_eq!(plays.len(), 10);
    for request in &plays {
        let body: Value = serde_json::from_slice(&request.body).expect("json body");
        assert_eq!(body["loadToken"], common::LOAD_TOKEN);
        assert_eq!(body["playId"], common::PLAY_ID);
        assert_eq!(body["series"], "gandalf");
        assert_eq!(body["postScoreReason"], "BLUR");

        let primary = body["primaryState"].as_str().expect("primaryState");
        let secondary = body["secondaryState"].as_str().expect("secondaryState");
        assert_eq!(primary.len(), 42);
        assert_eq!(secondary.len(), 42);
        for (p, s) in primary.bytes().zip(secondary.bytes()) {
            match s {
                b'0' => assert_eq!(p, b'#'),
                b'1' => assert!(p.is_ascii_lowercase()),
                other => panic!("secondary byte {other} outside 0/1"),
            }
        }
    }

    // The final post reports completion with a solved board.
    let last: Value = serde_json::from_slice(&plays[9].body).unwrap();
    assert_eq!(last["playState"], 4);
    assert!(last["secondaryState"].as_str().unwrap().bytes().all(|b| b == b'1'));
}

#[tokio::test]
async fn session_store_is_single_flight_under_contention() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;

    let store = Arc::new(SessionStore::new(
        test_client(),
        format!("{}/", server.uri()),
    ));

    let calls = (0..100).map(|_| {
        let store = Arc::clone(&store);
        async move { store.get_or_create("vansh", "d4725144", "gandalf").await }
    });
    let tokens = join_all(calls).await;

    for t in &tokens {
        assert!(t.is_valid());
        assert_eq!(t.load_token, common::LOAD_TOKEN);
        assert_eq!(t.play_id, common::PLAY_ID);
    }

    // One derivation: one date-picker GET and one crossword GET, total.
    assert_eq!(common::requests_for(&server, "GET", "/date-picker").await.len(), 1);
    assert_eq!(common::requests_for(&server, "GET", "/crossword").await.len(), 1);
    assert_eq!(store.valid_count().await, 1);
}

#[tokio::test]
async fn session_errors_are_memoized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/date-picker"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = SessionStore::new(test_client(), format!("{}/", server.uri()));
    let first = store.get_or_create("vansh", "d4725144", "gandalf").await;
    let second = store.get_or_create("vansh", "d4725144", "gandalf").await;

    assert!(!first.is_valid());
    assert!(first.error.as_deref().unwrap_or_default().contains("500"));
    assert_eq!(first, second);
    // The failed fetch is final: no second attempt went out.
    assert_eq!(common::requests_for(&server, "GET", "/date-picker").await.len(), 1);
}

#[tokio::test]
async fn picker_status_failures_are_attributed_and_counted() {
    let server = MockServer::start().await;
    common::mount_happy_target(&server).await;
    // Exactly one picker-status call draws a 500; the rest stay healthy.
    Mock::given(method("POST"))
        .and(path("/postPickerStatus"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let executor = WaveExecutor::builder().rps(2).duration(1).title("fail half").build();
    let aggregate = executor
        .execute(test_client(), test_config(&server))
        .await
        .expect("execute");

    assert_eq!(aggregate.records.len(), 2);
    let failed: Vec<_> = aggregate
        .records
        .iter()
        .filter(|r| !r.succeeded())
        .collect();
    assert_eq!(failed.len(), 1);

    let journey = failed[0].result.as_ref().expect("journey ran");
    assert!(!journey.success);
    assert!(journey.error.as_deref().unwrap().contains("500"));
    assert!(journey.step1.is_some());
    // The failing step and everything after it report no latency.
    assert!(journey.step2.is_none());
    assert!(journey.step3.is_none());
    assert!(journey.step4.is_none());

    let report = gridstorm::RunReport::from(aggregate);
    assert_eq!(report.overall.failed, 1);
    assert_eq!(report.overall.success, 1);
}

#[tokio::test]
async fn authed_client_retries_once_after_401() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok-a" })))
        .mount(&server)
        .await;
    // First puzzle fetch is rejected, the retry goes through.
    Mock::given(method("GET"))
        .and(path("/api/v1/puzzles"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/puzzles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "puzzles": [] })))
        .mount(&server)
        .await;

    let client = test_client();
    let authed = AuthedClient::new(
        Arc::clone(&client),
        format!("{}/", server.uri()),
        AuthConfig { client_id: "id".into(), client_secret: "secret".into() },
    );
    authed.bootstrap().await.expect("bootstrap");

    let url = format!("{}/api/v1/puzzles", server.uri());
    let response = authed
        .execute(|| client.request(reqwest::Method::GET, url.parse().unwrap()))
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    // Bootstrap token, then one forced refresh after the 401.
    assert_eq!(common::requests_for(&server, "POST", "/api/v1/token").await.len(), 2);
    let puzzle_calls = common::requests_for(&server, "GET", "/api/v1/puzzles").await;
    assert_eq!(puzzle_calls.len(), 2);
    for call in &puzzle_calls {
        let auth_header = call.headers.get("authorization").expect("bearer header");
        assert_eq!(auth_header.to_str().unwrap(), "Bearer tok-a");
    }
}

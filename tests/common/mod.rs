//! Mock crossword target shared by the integration tests.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const LOAD_TOKEN: &str = "lt-mock-123";
pub const PLAY_ID: &str = "play-mock-456";

/// HTML page embedding a params script, attribute order matching the real
/// tenant's markup.
pub fn params_html(params: serde_json::Value) -> String {
    format!(
        "<!DOCTYPE html><html><head>\
         <script type=\"application/json\" id=\"params\">{params}</script>\
         </head><body>puzzle</body></html>"
    )
}

pub fn date_picker_html(load_token: &str) -> String {
    let rawsps = BASE64.encode(json!({ "loadToken": load_token }).to_string());
    params_html(json!({ "rawsps": rawsps, "set": "gandalf" }))
}

pub fn crossword_html(play_id: &str) -> String {
    let rawp = BASE64.encode(
        json!({ "playId": play_id, "score": 0, "timeOnPage": 5000, "timeTaken": 5 }).to_string(),
    );
    params_html(json!({ "rawp": rawp }))
}

/// A target that answers every step of the journey successfully.
pub async fn mount_happy_target(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/date-picker"))
        .respond_with(ResponseTemplate::new(200).set_body_string(date_picker_html(LOAD_TOKEN)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/postPickerStatus"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": 0 })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crossword"))
        .respond_with(ResponseTemplate::new(200).set_body_string(crossword_html(PLAY_ID)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/plays"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": 0 })))
        .mount(server)
        .await;
}

/// Requests the server saw for `http_method` `http_path`.
pub async fn requests_for(server: &MockServer, http_method: &str, http_path: &str) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .into_iter()
        .filter(|r| r.method.as_str() == http_method && r.url.path() == http_path)
        .collect()
}

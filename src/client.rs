//! HTTP client wrapper: one shared pooled client plus the dispatcher
//! limits, response helpers, and HTML-envelope parsing the journeys and
//! replay handlers depend on.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, oneshot};
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Browser-ish identity, matching the recorded traffic.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36";
const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Connection-pool and dispatcher knobs. Defaults are sized for replaying
/// production bursts against a single host.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClientOptions {
    /// Max requests in flight across all hosts. Excess callers queue.
    #[builder(default = 200)]
    pub max_concurrent: usize,
    /// Max requests in flight per host.
    #[builder(default = 100)]
    pub max_per_host: usize,
    /// Cached idle connections kept per host.
    #[builder(default = 100)]
    pub pool_max_idle_per_host: usize,
    /// Idle connections are evicted after this long.
    #[builder(default = Duration::from_secs(300))]
    pub pool_idle_timeout: Duration,
    /// Applied to connect and to the whole request.
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    /// Trust all certificates, skip hostname verification. Off by default;
    /// only for self-signed test targets.
    #[builder(default = false)]
    pub insecure_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions::builder().build()
    }
}

/// The shared HTTP client every worker fires through. Cloning is cheap;
/// clones share one pool and one set of dispatcher limits.
///
/// Two semaphore layers implement the dispatcher contract: a global cap and
/// a per-host cap. Acquisition queues, it never sheds load; the pool itself
/// drops nothing.
///
/// Every request path detaches onto the runtime: the exchange (including
/// the body read) runs on its own task and the caller awaits a oneshot
/// that resolves exactly once, on the I/O completion. Aborting the caller
/// abandons the result, never the exchange.
#[derive(Clone)]
pub struct LoadClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    dispatch: Arc<Semaphore>,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    max_per_host: usize,
}

/// Run `work` on its own task, handing the result back through a oneshot.
fn detach<T>(
    work: impl Future<Output = Result<T>> + Send + 'static,
) -> impl Future<Output = Result<T>> + Send + 'static
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tx.send(work.await);
    });
    async move {
        rx.await
            .unwrap_or_else(|_| Err(Error::Internal("request task dropped".into())))
    }
}

impl LoadClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .pool_idle_timeout(options.pool_idle_timeout)
            .connect_timeout(options.timeout)
            .timeout(options.timeout)
            .user_agent(USER_AGENT);
        if options.insecure_tls {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        Ok(LoadClient {
            inner: Arc::new(Inner {
                http: builder.build()?,
                dispatch: Arc::new(Semaphore::new(options.max_concurrent)),
                per_host: Mutex::new(HashMap::new()),
                max_per_host: options.max_per_host,
            }),
        })
    }

    async fn acquire(&self, url: &Url) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
        let host = url.host_str().unwrap_or("").to_string();
        let host_sem = {
            let mut map = self.inner.per_host.lock().await;
            map.entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.inner.max_per_host)))
                .clone()
        };
        // Global first so a saturated host cannot starve the others of
        // queue positions. Closed-semaphore errors cannot happen here.
        let global = self
            .inner
            .dispatch
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore closed");
        let host = host_sem.acquire_owned().await.expect("host semaphore closed");
        (global, host)
    }

    /// Fire-and-forget submission: the request runs on the runtime and the
    /// returned future resolves exactly once, on the I/O completion rather
    /// than in the submitting task.
    pub fn fire(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + Send + 'static {
        let client = self.clone();
        detach(async move {
            let permits = client.acquire(request.url()).await;
            let response = client.inner.http.execute(request).await;
            drop(permits);
            Ok(response?)
        })
    }

    /// Send a request within the dispatcher limits; sugar for awaiting
    /// [`fire`](Self::fire). The returned response still carries its
    /// status; use the helpers below when a 2xx is required.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        self.fire(request).await
    }

    pub fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.inner.http.request(method, url)
    }

    /// GET an HTML page and return its body. Non-2xx is reported with the
    /// numeric status; the body is consumed either way so the connection
    /// goes back to the pool. Dispatcher permits are held until the body
    /// is fully read.
    pub async fn get_html(&self, url: Url) -> Result<String> {
        debug!(%url, "GET html");
        let client = self.clone();
        detach(async move {
            let permits = client.acquire(&url).await;
            let response = client
                .inner
                .http
                .get(url)
                .header(reqwest::header::ACCEPT, HTML_ACCEPT)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let _ = response.bytes().await;
                drop(permits);
                return Err(Error::Protocol { status: status.as_u16() });
            }
            let body = response.text().await?;
            drop(permits);
            Ok(body)
        })
        .await
    }

    /// GET a resource, drain the body, and report status plus byte count.
    /// Used for static assets and replayed page loads where the content
    /// itself does not matter.
    pub async fn get_discard(&self, url: Url) -> Result<(u16, u64)> {
        let client = self.clone();
        detach(async move {
            let permits = client.acquire(&url).await;
            let response = client
                .inner
                .http
                .get(url)
                .header(reqwest::header::ACCEPT, HTML_ACCEPT)
                .send()
                .await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            drop(permits);
            if !status.is_success() {
                return Err(Error::Protocol { status: status.as_u16() });
            }
            Ok((status.as_u16(), bytes.len() as u64))
        })
        .await
    }

    /// POST a JSON payload and decode the JSON response.
    pub async fn post_json(&self, url: Url, payload: &Value) -> Result<Value> {
        debug!(%url, "POST json");
        let client = self.clone();
        let payload = payload.clone();
        detach(async move {
            let permits = client.acquire(&url).await;
            let response = client.inner.http.post(url).json(&payload).send().await?;
            let status = response.status();
            if !status.is_success() {
                let _ = response.bytes().await;
                drop(permits);
                return Err(Error::Protocol { status: status.as_u16() });
            }
            let body = response.json().await?;
            drop(permits);
            Ok(body)
        })
        .await
    }
}

/// Build `<base><path>?<query>` with proper encoding.
pub fn url_with(base: &str, path: &str, query: &[(&str, &str)]) -> Result<Url> {
    let joined = format!("{base}{path}");
    let result = if query.is_empty() {
        Url::parse(&joined)
    } else {
        Url::parse_with_params(&joined, query)
    };
    result.map_err(|e| Error::Config(format!("bad url {joined}: {e}")))
}

fn params_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r#"(?s)<script[^>]*type="application/json"[^>]*id="params"[^>]*>(.*?)</script>"#)
                .expect("params regex"),
            Regex::new(r#"(?s)<script[^>]*id="params"[^>]*type="application/json"[^>]*>(.*?)</script>"#)
                .expect("params regex"),
        ]
    })
}

/// Locate the embedded `<script id="params" type="application/json">` block
/// (either attribute order) and parse its JSON.
pub fn extract_params(html: &str) -> Result<Value> {
    for pattern in params_patterns() {
        if let Some(captures) = pattern.captures(html) {
            let raw = captures.get(1).expect("capture group").as_str().trim();
            return serde_json::from_str(raw)
                .map_err(|e| Error::parse(format!("params script is not JSON: {e}")));
        }
    }
    Err(Error::parse("couldn't find params script tag in response"))
}

/// Decode a base64 string carrying JSON, as the `rawsps`/`rawp` sub-fields do.
pub fn decode_b64_json(encoded: &str) -> Result<Value> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| Error::parse(format!("undecodable base64: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::parse(format!("base64 payload is not JSON: {e}")))
}

/// Pull a required string field out of a params sub-object.
pub fn require_str(value: &Value, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::parse(format!("no {field} in response")))
}

/// JSON endpoints answer `{"status": 0}` on success; anything else is a
/// logic failure carrying the whole body for diagnosis.
pub fn require_status_zero(endpoint: &'static str, data: &Value) -> Result<()> {
    match data.get("status").and_then(Value::as_i64) {
        Some(0) => Ok(()),
        _ => Err(Error::Logic { endpoint, detail: data.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"rawsps": "eyJsb2FkVG9rZW4iOiAiYWJjMTIzIn0=", "other": 1}"#;

    #[test]
    fn extracts_params_type_first() {
        let html = format!(
            "<html><head><script type=\"application/json\" id=\"params\">{PAYLOAD}</script></head></html>"
        );
        let params = extract_params(&html).unwrap();
        assert_eq!(params["other"], 1);
    }

    #[test]
    fn extracts_params_id_first() {
        let html = format!(
            "<html><script id=\"params\" type=\"application/json\">{PAYLOAD}</script></html>"
        );
        let params = extract_params(&html).unwrap();
        assert!(params["rawsps"].is_string());
    }

    #[test]
    fn extracts_params_across_newlines() {
        let html =
            format!("<script id=\"params\" type=\"application/json\">\n  {PAYLOAD}\n</script>");
        assert!(extract_params(&html).is_ok());
    }

    #[test]
    fn missing_script_tag_is_a_parse_error() {
        let err = extract_params("<html><body>PuzzleMe Error</body></html>").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn decodes_b64_json_subfield() {
        let params = extract_params(&format!(
            "<script id=\"params\" type=\"application/json\">{PAYLOAD}</script>"
        ))
        .unwrap();
        let decoded = decode_b64_json(params["rawsps"].as_str().unwrap()).unwrap();
        assert_eq!(require_str(&decoded, "loadToken").unwrap(), "abc123");
    }

    #[test]
    fn garbage_b64_is_a_parse_error() {
        assert!(matches!(decode_b64_json("!!not-base64!!"), Err(Error::Parse(_))));
    }

    #[test]
    fn status_zero_gate() {
        assert!(require_status_zero("plays", &serde_json::json!({"status": 0})).is_ok());
        let err = require_status_zero("plays", &serde_json::json!({"status": 7})).unwrap_err();
        assert!(err.to_string().contains("plays"));
        assert!(require_status_zero("plays", &serde_json::json!({"ok": true})).is_err());
    }

    #[test]
    fn url_with_encodes_query() {
        let url = url_with("http://host/", "crossword", &[("src", "a b&c"), ("uid", "x")]).unwrap();
        assert_eq!(url.path(), "/crossword");
        assert!(url.query().unwrap().contains("src=a+b%26c") || url.query().unwrap().contains("src=a%20b%26c"));
    }

    #[test]
    fn url_without_query_has_no_question_mark() {
        let url = url_with("http://host/", "postPickerStatus", &[]).unwrap();
        assert_eq!(url.as_str(), "http://host/postPickerStatus");
    }

    #[tokio::test]
    async fn fire_resolves_on_io_completion() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&server)
            .await;

        let client = Arc::new(LoadClient::new(ClientOptions::default()).unwrap());
        let url: Url = format!("{}/ping", server.uri()).parse().unwrap();
        let request = client.request(reqwest::Method::GET, url).build().unwrap();

        // The future is detached from the submitting task and completes once.
        let pending = client.fire(request);
        let response = pending.await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn dispatcher_queues_rather_than_drops() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(30)))
            .mount(&server)
            .await;

        // Two in flight at a time; ten submissions all succeed eventually.
        let client = Arc::new(
            LoadClient::new(
                ClientOptions::builder().max_concurrent(2).max_per_host(2).build(),
            )
            .unwrap(),
        );
        let url: Url = format!("{}/slow", server.uri()).parse().unwrap();
        let results = futures::future::join_all((0..10).map(|_| {
            let client = Arc::clone(&client);
            let url = url.clone();
            async move { client.get_discard(url).await }
        }))
        .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(server.received_requests().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn exchange_outlives_an_aborted_caller() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(150)),
            )
            .mount(&server)
            .await;

        let client = LoadClient::new(ClientOptions::default()).unwrap();
        let url: Url = format!("{}/slow", server.uri()).parse().unwrap();

        let caller = tokio::spawn({
            let client = client.clone();
            let url = url.clone();
            async move { client.get_discard(url).await }
        });
        // Let the request get onto the wire, then kill the caller mid-flight.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        caller.abort();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        // The exchange ran to completion on its own task, and the dispatcher
        // permits came back: a fresh request goes straight through.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
        assert!(client.get_discard(url).await.is_ok());
    }
}

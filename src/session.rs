//! Per-user session derivation and memoization.
//!
//! Replayed traffic carries stale credentials, and every journey needs a
//! `loadToken` before it can do anything useful. The store derives fresh
//! tokens by walking the date-picker and crossword pages, memoizes the
//! outcome per `(uid, puzzle)`, and guarantees at most one derivation is
//! ever in flight per key: concurrent callers share the same pending fetch
//! and observe the same result. Resolved values are final for the lifetime
//! of the store; failures are memoized too.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::client::{self, LoadClient, url_with};
use crate::error::Result;

/// A session is scoped to one virtual user playing one puzzle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub uid: String,
    pub puzzle: String,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.uid, self.puzzle)
    }
}

/// The derived credentials for one key. Valid iff the load token is
/// non-empty; the play id may legitimately be empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTokens {
    #[serde(rename = "loadToken")]
    pub load_token: String,
    #[serde(rename = "playId", default)]
    pub play_id: String,
    #[serde(skip)]
    pub error: Option<String>,
}

impl SessionTokens {
    pub fn new(load_token: String, play_id: String) -> Self {
        SessionTokens { load_token, play_id, error: None }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        SessionTokens { load_token: String::new(), play_id: String::new(), error: Some(error.into()) }
    }

    pub fn is_valid(&self) -> bool {
        !self.load_token.is_empty()
    }
}

/// Memoization table from key to derived tokens, with single-flight fetch.
///
/// Each key owns a `OnceCell`: the first caller installs the derivation
/// future, later callers await the same cell. This is a memo table, not a
/// cache — nothing is ever evicted, and an expired token surfaces naturally
/// on its first real request.
pub struct SessionStore {
    client: Arc<LoadClient>,
    base_url: String,
    cells: Mutex<HashMap<SessionKey, Arc<OnceCell<SessionTokens>>>>,
}

impl SessionStore {
    pub fn new(client: Arc<LoadClient>, base_url: impl Into<String>) -> Self {
        SessionStore {
            client,
            base_url: base_url.into(),
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// Cached tokens for the key, deriving them on first use. Concurrent
    /// callers for the same key coalesce onto one fetch.
    pub async fn get_or_create(&self, uid: &str, puzzle: &str, series: &str) -> SessionTokens {
        let key = SessionKey { uid: uid.into(), puzzle: puzzle.into() };
        let cell = {
            let mut cells = self.cells.lock().await;
            cells.entry(key.clone()).or_default().clone()
        };
        cell.get_or_init(|| async {
            match self.derive(uid, puzzle, series).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    debug!(%key, error = %e, "session derivation failed");
                    SessionTokens::invalid(e.to_string())
                }
            }
        })
        .await
        .clone()
    }

    /// Step A: the date-picker page yields the load token; step B: the
    /// crossword page yields the play id (possibly empty).
    async fn derive(&self, uid: &str, puzzle: &str, series: &str) -> Result<SessionTokens> {
        let load_token = self.fetch_load_token(uid, series).await?;
        let play_id = self.fetch_play_id(uid, puzzle, &load_token, series).await?;
        Ok(SessionTokens::new(load_token, play_id))
    }

    async fn fetch_load_token(&self, uid: &str, series: &str) -> Result<String> {
        let url = url_with(&self.base_url, "date-picker", &[("set", series), ("uid", uid)])?;
        let html = self.client.get_html(url).await?;
        let params = client::extract_params(&html)?;
        let rawsps = client::require_str(&params, "rawsps")?;
        let decoded = client::decode_b64_json(&rawsps)?;
        client::require_str(&decoded, "loadToken")
    }

    async fn fetch_play_id(
        &self,
        uid: &str,
        puzzle: &str,
        load_token: &str,
        series: &str,
    ) -> Result<String> {
        let src = format!("{}date-picker?set={}&uid={}", self.base_url, series, uid);
        let url = url_with(
            &self.base_url,
            "crossword",
            &[
                ("id", puzzle),
                ("set", series),
                ("picker", "date-picker"),
                ("src", &src),
                ("uid", uid),
                ("loadToken", load_token),
            ],
        )?;
        let html = self.client.get_html(url).await?;
        let params = client::extract_params(&html)?;
        let Some(rawp) = params.get("rawp").and_then(serde_json::Value::as_str) else {
            return Ok(String::new());
        };
        let decoded = client::decode_b64_json(rawp)?;
        Ok(decoded
            .get("playId")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Warm many keys with bounded parallelism. Individual failures are
    /// counted, never fatal. Returns (valid, failed).
    pub async fn bulk_warm(
        &self,
        keys: Vec<(String, String, String)>,
        parallelism: usize,
    ) -> (usize, usize) {
        if keys.is_empty() {
            return (0, 0);
        }
        let total = keys.len();
        info!(total, parallelism, "pre-warming sessions");

        let mut valid = 0usize;
        let mut done = 0usize;
        let mut results = futures::stream::iter(keys.into_iter().map(|(uid, puzzle, series)| {
            async move { self.get_or_create(&uid, &puzzle, &series).await }
        }))
        .buffer_unordered(parallelism.max(1));

        while let Some(tokens) = results.next().await {
            done += 1;
            if tokens.is_valid() {
                valid += 1;
            }
            if done % 50 == 0 || done == total {
                info!(done, total, valid, "pre-warm progress");
            }
        }
        let failed = total - valid;
        if failed > 0 {
            warn!(failed, "sessions failed to warm");
        }
        (valid, failed)
    }

    /// Number of resolved keys.
    pub async fn len(&self) -> usize {
        let cells = self.cells.lock().await;
        cells.values().filter(|c| c.initialized()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolved keys holding a usable load token.
    pub async fn valid_count(&self) -> usize {
        let cells = self.cells.lock().await;
        cells
            .values()
            .filter_map(|c| c.get())
            .filter(|t| t.is_valid())
            .count()
    }

    /// Serialize every valid session, keyed by uid, to a JSON file.
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let map: HashMap<String, SessionTokens> = {
            let cells = self.cells.lock().await;
            cells
                .iter()
                .filter_map(|(key, cell)| cell.get().map(|t| (key, t)))
                .filter(|(_, tokens)| tokens.is_valid())
                .map(|(key, tokens)| (key.uid.clone(), tokens.clone()))
                .collect()
        };
        let count = map.len();
        std::fs::write(path, serde_json::to_string_pretty(&map)?)?;
        Ok(count)
    }

    /// Populate the store from a cache file without touching the network.
    /// Every uid is bound to `puzzle`, the run's fixed puzzle id. A missing
    /// file is not an error; stale tokens fail on their first real request.
    pub async fn load_from_file(&self, path: impl AsRef<Path>, puzzle: &str) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }
        let map: HashMap<String, SessionTokens> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        if map.is_empty() {
            return Ok(false);
        }
        let mut cells = self.cells.lock().await;
        for (uid, tokens) in map {
            let key = SessionKey { uid, puzzle: puzzle.into() };
            cells.insert(key, Arc::new(OnceCell::new_with(Some(tokens))));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientOptions;

    fn store() -> SessionStore {
        let client = Arc::new(LoadClient::new(ClientOptions::default()).unwrap());
        SessionStore::new(client, "http://localhost:1/")
    }

    #[tokio::test]
    async fn cache_file_round_trip() {
        let store = store();
        {
            let mut cells = store.cells.lock().await;
            cells.insert(
                SessionKey { uid: "vansh".into(), puzzle: "d4725144".into() },
                Arc::new(OnceCell::new_with(Some(SessionTokens::new("tok-1".into(), "play-1".into())))),
            );
            cells.insert(
                SessionKey { uid: "other".into(), puzzle: "d4725144".into() },
                Arc::new(OnceCell::new_with(Some(SessionTokens::invalid("HTTP 500")))),
            );
        }

        let path = std::env::temp_dir().join(format!("gridstorm-sessions-{}.json", std::process::id()));
        let saved = store.save_to_file(&path).await.unwrap();
        // Invalid sessions are not worth persisting.
        assert_eq!(saved, 1);

        let restored = self::store();
        assert!(restored.load_from_file(&path, "d4725144").await.unwrap());
        let tokens = restored.get_or_create("vansh", "d4725144", "gandalf").await;
        assert_eq!(tokens.load_token, "tok-1");
        assert_eq!(tokens.play_id, "play-1");
        assert_eq!(restored.valid_count().await, 1);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn missing_cache_file_reports_false() {
        let store = store();
        let loaded = store
            .load_from_file("/nonexistent/gridstorm-sessions.json", "d4725144")
            .await
            .unwrap();
        assert!(!loaded);
        assert!(store.is_empty().await);
    }

    #[test]
    fn validity_follows_load_token() {
        assert!(SessionTokens::new("tok".into(), String::new()).is_valid());
        assert!(!SessionTokens::invalid("no rawsps in response").is_valid());
        assert!(!SessionTokens::default().is_valid());
    }
}

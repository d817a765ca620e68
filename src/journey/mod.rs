//! The scripted user journey: date-picker, picker status, crossword, ten
//! play posts. Steps run strictly in order against a single logical session;
//! the first failure aborts the journey and later steps never run.

pub mod state;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::debug;

use crate::client::{self, LoadClient, url_with};
use crate::config::{JourneyVariant, RunConfig};
use crate::error::{Error, Result};
use crate::metric::{
    AssetMetric, JourneyMetric, PlayIteration, PlaysMetric, StepMetric, now_ms,
};
use state::StateVector;

/// Browser string reported in play posts.
const BROWSER: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                       (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

/// Cache-buster carried by the tenant-scoped asset URLs.
const ASSET_VERSION: &str = "6aee5d1bf087693e360c8e38dac76fecc9ad81a90abc9ed19cb26a97e1759919";

const FONT_ASSETS: [&str; 2] = [
    "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.2.0/css/all.min.css",
    "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.2.0/webfonts/fa-solid-900.woff2",
];

/// Scratchpad carrying outputs of completed steps into later ones. Created
/// at journey start, owned by the executing worker, dropped at the end.
#[derive(Debug, Default)]
struct Context {
    uid: String,
    load_token: String,
    play_id: String,
    decoded_play: Option<Value>,
}

/// Executes journeys against the target. Cheap to clone per work item; the
/// client and config are shared.
#[derive(Clone)]
pub struct JourneyRunner {
    client: Arc<LoadClient>,
    config: Arc<RunConfig>,
}

impl JourneyRunner {
    pub fn new(client: Arc<LoadClient>, config: Arc<RunConfig>) -> Self {
        JourneyRunner { client, config }
    }

    /// Run one full journey. Failures never escape as errors; they are
    /// folded into the metric with the completed steps' timings intact.
    pub async fn run(&self) -> JourneyMetric {
        let mut metric = JourneyMetric::default();
        match self.run_steps(&mut metric).await {
            Ok(()) => metric.success = true,
            Err(e) => {
                debug!(error = %e, "journey failed");
                metric.success = false;
                metric.error = Some(e.to_string());
            }
        }
        metric
    }

    async fn run_steps(&self, metric: &mut JourneyMetric) -> Result<()> {
        let mut ctx = Context { uid: self.config.choose_uid(), ..Context::default() };
        metric.step1 = Some(self.step1_date_picker(&mut ctx).await?);
        metric.step2 = Some(self.step2_post_picker_status(&ctx).await?);
        metric.step3 = Some(self.step3_load_crossword(&mut ctx).await?);
        metric.step4 = Some(self.step4_post_plays(&ctx).await?);
        Ok(())
    }

    fn with_assets(&self) -> bool {
        self.config.variant == JourneyVariant::WithStaticAssets
    }

    /// Step 1: the date-picker page yields the load token. The with-assets
    /// variant then pulls the page's static resources; their latencies sum
    /// into the step.
    async fn step1_date_picker(&self, ctx: &mut Context) -> Result<StepMetric> {
        let start_timestamp = now_ms();
        debug!(uid = %ctx.uid, "step 1: GET date-picker");
        let url = url_with(
            &self.config.base(),
            "date-picker",
            &[("set", &self.config.series), ("uid", &ctx.uid)],
        )?;

        let started = Instant::now();
        let html = self.client.get_html(url).await?;
        let mut latency_ms = elapsed_ms(started);

        let params = client::extract_params(&html)?;
        let rawsps = client::require_str(&params, "rawsps")?;
        let decoded = client::decode_b64_json(&rawsps)?;
        ctx.load_token = client::require_str(&decoded, "loadToken")?;

        let mut assets = Vec::new();
        if self.with_assets() {
            let cdn = &self.config.cdn_prefix;
            let urls = [
                format!("{cdn}/css/date-picker-min.css?v={ASSET_VERSION}"),
                format!("{cdn}/js/picker-min.js?v={ASSET_VERSION}"),
                FONT_ASSETS[0].to_string(),
                FONT_ASSETS[1].to_string(),
            ];
            for url in urls {
                let asset = self.fetch_asset(&url).await;
                latency_ms += asset.latency_ms;
                assets.push(asset);
            }
        }

        Ok(StepMetric {
            start_timestamp,
            end_timestamp: now_ms(),
            latency_ms,
            success: true,
            uid: Some(ctx.uid.clone()),
            error: None,
            assets,
        })
    }

    /// Step 2: report the picker as displayed. The target must answer
    /// `status: 0`.
    async fn step2_post_picker_status(&self, ctx: &Context) -> Result<StepMetric> {
        let start_timestamp = now_ms();
        debug!("step 2: POST postPickerStatus");
        let url = url_with(&self.config.base(), "postPickerStatus", &[])?;
        let payload = json!({
            "loadToken": ctx.load_token,
            "isVerified": true,
            "adDuration": 0,
            "reason": "displaying puzzle picker",
        });

        let started = Instant::now();
        let data = self.client.post_json(url, &payload).await?;
        let latency_ms = elapsed_ms(started);
        client::require_status_zero("postPickerStatus", &data)?;

        Ok(StepMetric {
            start_timestamp,
            end_timestamp: now_ms(),
            latency_ms,
            success: true,
            uid: None,
            error: None,
            assets: Vec::new(),
        })
    }

    /// Step 3: load the crossword page for the configured puzzle and stash
    /// the play id when the response carries one.
    async fn step3_load_crossword(&self, ctx: &mut Context) -> Result<StepMetric> {
        let start_timestamp = now_ms();
        let base = self.config.base();
        let puzzle = &self.config.puzzle_id;
        debug!(puzzle = %puzzle, "step 3: GET crossword");
        let src = format!("{base}date-picker?set={}&uid={}", self.config.series, ctx.uid);
        let url = url_with(
            &base,
            "crossword",
            &[
                ("id", puzzle.as_str()),
                ("set", &self.config.series),
                ("picker", "date-picker"),
                ("src", &src),
                ("uid", &ctx.uid),
                ("loadToken", &ctx.load_token),
            ],
        )?;

        let started = Instant::now();
        let html = self.client.get_html(url).await?;
        let mut latency_ms = elapsed_ms(started);

        let params = client::extract_params(&html)?;
        if let Some(rawp) = params.get("rawp").and_then(Value::as_str) {
            let decoded = client::decode_b64_json(rawp)?;
            if let Some(play_id) = decoded.get("playId").and_then(Value::as_str) {
                ctx.play_id = play_id.to_string();
            }
            ctx.decoded_play = Some(decoded);
        }

        let mut assets = Vec::new();
        if self.with_assets() {
            let cdn = &self.config.cdn_prefix;
            let urls = [
                format!("{cdn}/css/crossword-player-min.css?v={ASSET_VERSION}"),
                format!("{cdn}/js/c-min.js?v={ASSET_VERSION}"),
            ];
            for url in urls {
                let asset = self.fetch_asset(&url).await;
                latency_ms += asset.latency_ms;
                assets.push(asset);
            }
        }

        Ok(StepMetric {
            start_timestamp,
            end_timestamp: now_ms(),
            latency_ms,
            success: true,
            uid: None,
            error: None,
            assets,
        })
    }

    /// Step 4: simulate play with exactly ten posts. Iteration 1 starts the
    /// play, 2-9 mutate the board, 10 completes it.
    async fn step4_post_plays(&self, ctx: &Context) -> Result<PlaysMetric> {
        let start_timestamp = now_ms();
        let len = self.config.state_len;
        debug!(state_len = len, "step 4: POST plays x10");
        let url = url_with(&self.config.base(), "api/v1/plays", &[])?;

        // Thread-local rng must not be held across an await, so every state
        // change happens in its own scope.
        let mut board = {
            let mut rng = rand::thread_rng();
            StateVector::generate(len, 0.1, &mut rng)
        };

        let mut iterations = Vec::with_capacity(10);
        let mut total_latency = 0.0;

        for i in 0..10u32 {
            let (play_state, primary, secondary) = match i {
                0 => (1u8, board.primary().to_string(), board.secondary().to_string()),
                9 => {
                    let solved = {
                        let mut rng = rand::thread_rng();
                        StateVector::complete(len, &mut rng)
                    };
                    (4, solved.primary().to_string(), solved.secondary().to_string())
                }
                _ => {
                    {
                        let mut rng = rand::thread_rng();
                        board.mutate(&mut rng);
                    }
                    (2, board.primary().to_string(), board.secondary().to_string())
                }
            };

            let payload = self.play_payload(ctx, play_state, &primary, &secondary);
            let started = Instant::now();
            let data = self.client.post_json(url.clone(), &payload).await?;
            let latency_ms = elapsed_ms(started);
            total_latency += latency_ms;

            if let Err(e) = client::require_status_zero("plays", &data) {
                let detail = match e {
                    Error::Logic { detail, .. } => detail,
                    other => other.to_string(),
                };
                return Err(Error::Logic {
                    endpoint: "plays",
                    detail: format!("iteration {}: {detail}", i + 1),
                });
            }
            debug!(iteration = i + 1, play_state, latency_ms, "play posted");
            iterations.push(PlayIteration { iteration: i + 1, play_state, latency_ms });
        }

        Ok(PlaysMetric {
            start_timestamp,
            end_timestamp: now_ms(),
            latency_ms: total_latency,
            success: true,
            error: None,
            iterations,
        })
    }

    fn play_payload(&self, ctx: &Context, play_state: u8, primary: &str, secondary: &str) -> Value {
        let ts = now_ms();
        let play = ctx.decoded_play.as_ref();
        let field = |name: &str, default: i64| {
            play.and_then(|p| p.get(name)).and_then(Value::as_i64).unwrap_or(default)
        };
        json!({
            "browser": BROWSER,
            "fromPicker": "date-picker",
            "getProgressFromBackend": true,
            "id": self.config.puzzle_id,
            "inContestMode": false,
            "loadToken": ctx.load_token,
            "nClearClicks": 0,
            "nExceptions": 0,
            "nHelpClicks": 0,
            "nPrints": 0,
            "nPrintsEmpty": 0,
            "nPrintsFilled": 0,
            "nPrintsSol": 0,
            "nResizes": 0,
            "nSettingsClicks": 0,
            "playId": ctx.play_id,
            "playState": play_state,
            "postScoreReason": "BLUR",
            "primaryState": primary,
            "score": field("score", 0),
            "secondaryState": secondary,
            "series": self.config.series,
            "streakLength": 0,
            "timeOnPage": field("timeOnPage", 5000),
            "timeTaken": field("timeTaken", 5),
            "timestamp": ts,
            "updateLoadTable": false,
            "updatePlayTable": true,
            "updatedTimestamp": ts,
            "userId": ctx.uid,
        })
    }

    /// One static-asset GET. Failures are recorded, never propagated; a
    /// missing stylesheet is not a failed journey.
    async fn fetch_asset(&self, url: &str) -> AssetMetric {
        let started = Instant::now();
        let parsed = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                debug!(url, error = %e, "asset url unparseable");
                return AssetMetric {
                    url: url.to_string(),
                    status_code: None,
                    latency_ms: 0.0,
                    success: false,
                };
            }
        };
        match self.client.get_discard(parsed).await {
            Ok((status, _)) => AssetMetric {
                url: url.to_string(),
                status_code: Some(status),
                latency_ms: elapsed_ms(started),
                success: true,
            },
            Err(Error::Protocol { status }) => AssetMetric {
                url: url.to_string(),
                status_code: Some(status),
                latency_ms: elapsed_ms(started),
                success: false,
            },
            Err(e) => {
                debug!(url, error = %e, "asset fetch failed");
                AssetMetric {
                    url: url.to_string(),
                    status_code: None,
                    latency_ms: elapsed_ms(started),
                    success: false,
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

//! Ensemble transfer scoring: numeric model probability fused with an
//! LLM-derived news signal, plus the backtest runner over archived data.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tl_adapters::{NewsFeed, ProfileLookup};
use tl_core::{column_index, split_csv_line, FeatureVector};
use tl_storage::ObjectStore;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "tl-predict";

/// Assembled once at process start; components receive it by value and never
/// read the environment themselves.
#[derive(Debug, Clone)]
pub struct PredictConfig {
    pub model_endpoint: String,
    pub model_bearer_token: Option<String>,
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub article_cap: usize,
    /// Weight of the base model probability on the live/web path.
    pub live_fusion_weight: f64,
    /// Weight of the base model probability on the backtest path.
    pub backtest_fusion_weight: f64,
    pub classify_base_tokens: u32,
    pub classify_max_attempts: u32,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            model_endpoint: "http://127.0.0.1:8501/invocations".to_string(),
            model_bearer_token: None,
            llm_endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            article_cap: 5,
            live_fusion_weight: 0.1,
            backtest_fusion_weight: 0.3,
            classify_base_tokens: 256,
            classify_max_attempts: 3,
        }
    }
}

impl PredictConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            model_endpoint: std::env::var("TL_MODEL_ENDPOINT").unwrap_or(defaults.model_endpoint),
            model_bearer_token: std::env::var("TL_MODEL_TOKEN").ok().filter(|t| !t.is_empty()),
            llm_endpoint: std::env::var("TL_LLM_ENDPOINT").unwrap_or(defaults.llm_endpoint),
            llm_api_key: std::env::var("TL_LLM_API_KEY").unwrap_or(defaults.llm_api_key),
            llm_model: std::env::var("TL_LLM_MODEL").unwrap_or(defaults.llm_model),
            article_cap: std::env::var("TL_ARTICLE_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.article_cap),
            live_fusion_weight: std::env::var("TL_LIVE_FUSION_WEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.live_fusion_weight),
            backtest_fusion_weight: std::env::var("TL_BACKTEST_FUSION_WEIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.backtest_fusion_weight),
            classify_base_tokens: defaults.classify_base_tokens,
            classify_max_attempts: defaults.classify_max_attempts,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("unparseable model score '{raw}'")]
    Malformed { raw: String },
}

/// The hosted numeric model: CSV feature line in, one float probability out.
#[async_trait]
pub trait ScoreModel: Send + Sync {
    async fn score(&self, features: &FeatureVector) -> Result<f64, ModelError>;
}

pub struct HttpScoreModel {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpScoreModel {
    pub fn new(config: &PredictConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building model http client")?;
        Ok(Self {
            client,
            endpoint: config.model_endpoint.clone(),
            bearer_token: config.model_bearer_token.clone(),
        })
    }
}

#[async_trait]
impl ScoreModel for HttpScoreModel {
    async fn score(&self, features: &FeatureVector) -> Result<f64, ModelError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/csv")
            .body(features.to_csv_line());
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ModelError::Http {
                status: status.as_u16(),
                body,
            });
        }
        body.trim()
            .parse()
            .map_err(|_| ModelError::Malformed { raw: body })
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("llm response carried no choices")]
    EmptyChoices,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    /// True only when the completion reported a natural stop; a budget
    /// cut-off mid-JSON is not acceptance-worthy.
    pub natural_stop: bool,
}

/// One chat completion round trip. Kept minimal so the retry protocol can be
/// driven against a scripted implementation.
#[async_trait]
pub trait ChatCompletion: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, LlmError>;
}

#[derive(Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    response_format: WireResponseFormat,
    messages: Vec<WireChatMessage<'a>>,
}

#[derive(Serialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct WireChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChatChoice>,
}

#[derive(Deserialize)]
struct WireChatChoice {
    message: WireAssistantMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireAssistantMessage {
    content: String,
}

/// OpenAI-style chat completions client with bearer auth.
pub struct OpenAiChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(config: &PredictConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .context("building llm http client")?;
        Ok(Self {
            client,
            endpoint: config.llm_endpoint.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }
}

#[async_trait]
impl ChatCompletion for OpenAiChat {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, LlmError> {
        let body = WireChatRequest {
            model: &self.model,
            temperature: 0.0,
            max_tokens: request.max_tokens,
            response_format: WireResponseFormat {
                kind: "json_object",
            },
            messages: vec![
                WireChatMessage {
                    role: "system",
                    content: &request.system,
                },
                WireChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: WireChatResponse = resp.json().await?;
        let choice = parsed.choices.into_iter().next().ok_or(LlmError::EmptyChoices)?;
        Ok(ChatOutcome {
            natural_stop: choice.finish_reason.as_deref() == Some("stop"),
            content: choice.message.content,
        })
    }
}

/// Per-article probabilities plus the overall probability, all in [0,1].
/// The empty bundle means "no signal", never "confirmed no transfer".
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreBundle {
    pub per_article: Vec<f64>,
    pub overall: f64,
}

impl ScoreBundle {
    pub fn empty() -> Self {
        Self {
            per_article: Vec::new(),
            overall: 0.0,
        }
    }
}

const CLASSIFIER_INSTRUCTION: &str = "\
You are a football transfer prediction assistant.
For each ARTICLE_i (plain-text summary below), estimate the 0-100 probability it reports a genuine, still-possible transfer move.
Then give an overall_probability (0-100) for the transfer happening.

Special rules:
- If any ARTICLE_i reports a recent contract extension or re-signing, reduce that ARTICLE_i's probability by at least 30 points and bias the overall_probability downward accordingly.
- If any ARTICLE_i says the player's current club is actively interested in keeping them (e.g. \"club wants to keep\", \"offer new deal\"), boost that ARTICLE_i's probability by at least 20 points and bias the overall_probability upward accordingly.
- If any ARTICLE_i contains the keyword \"FA\" (or \"Free Agent\"), boost that ARTICLE_i's probability by at least 20 points and bias overall_probability upward accordingly.

Return ONLY valid JSON like:
{
  \"per_article\":[12,55,88],
  \"overall_probability\":67
}";

#[derive(Debug, Deserialize)]
struct RawClassification {
    per_article: Vec<f64>,
    overall_probability: f64,
}

/// Bounded-retry structured extraction. Each attempt doubles the token
/// budget, whatever the failure was: a truncated completion and a malformed
/// one look the same to the caller and both deserve a larger budget.
pub struct TransferClassifier {
    chat: Box<dyn ChatCompletion>,
    base_token_budget: u32,
    max_attempts: u32,
}

impl TransferClassifier {
    pub fn new(chat: Box<dyn ChatCompletion>, config: &PredictConfig) -> Self {
        Self {
            chat,
            base_token_budget: config.classify_base_tokens,
            max_attempts: config.classify_max_attempts,
        }
    }

    fn user_message(articles: &[String]) -> String {
        articles
            .iter()
            .enumerate()
            .map(|(i, summary)| format!("ARTICLE_{}\n\n{summary}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }

    /// Never fails: exhausted retries produce the empty bundle.
    pub async fn classify(&self, articles: &[String]) -> ScoreBundle {
        if articles.is_empty() {
            return ScoreBundle::empty();
        }

        let user = Self::user_message(articles);
        let mut max_tokens = self.base_token_budget;

        for attempt in 1..=self.max_attempts {
            let request = ChatRequest {
                system: CLASSIFIER_INSTRUCTION.to_string(),
                user: user.clone(),
                max_tokens,
            };

            match self.chat.complete(&request).await {
                Ok(outcome) if outcome.natural_stop => {
                    match serde_json::from_str::<RawClassification>(&outcome.content) {
                        Ok(raw) => {
                            return ScoreBundle {
                                per_article: raw.per_article.iter().map(|p| p / 100.0).collect(),
                                overall: raw.overall_probability / 100.0,
                            };
                        }
                        Err(err) => {
                            warn!(attempt, max_tokens, error = %err, "classification JSON did not parse");
                        }
                    }
                }
                Ok(_) => {
                    warn!(attempt, max_tokens, "completion stopped early; raising budget");
                }
                Err(err) => {
                    warn!(attempt, max_tokens, error = %err, "classification request failed");
                }
            }
            max_tokens *= 2;
        }

        warn!("classification retries exhausted; treating as no signal");
        ScoreBundle::empty()
    }
}

/// The fused prediction with its ingredients, for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored {
    pub base_probability: f64,
    pub text_score: f64,
    pub transfer_chance: f64,
}

/// Profile → features → base probability; news → text score; convex fusion.
/// The numeric-model and profile failures propagate; the text signal
/// degrades to 0.0 on its own.
pub struct EnsembleScorer {
    profile: Box<dyn ProfileLookup>,
    model: Box<dyn ScoreModel>,
    feed: Box<dyn NewsFeed>,
    classifier: TransferClassifier,
    fusion_weight: f64,
    article_cap: usize,
}

impl EnsembleScorer {
    pub fn new(
        profile: Box<dyn ProfileLookup>,
        model: Box<dyn ScoreModel>,
        feed: Box<dyn NewsFeed>,
        classifier: TransferClassifier,
        fusion_weight: f64,
        article_cap: usize,
    ) -> Self {
        Self {
            profile,
            model,
            feed,
            classifier,
            fusion_weight,
            article_cap,
        }
    }

    pub fn fuse(weight: f64, base_probability: f64, text_score: f64) -> f64 {
        weight * base_probability + (1.0 - weight) * text_score
    }

    pub async fn score(&self, player_name: &str) -> Result<Scored> {
        let profile = self
            .profile
            .lookup(player_name)
            .await
            .with_context(|| format!("looking up profile for '{player_name}'"))?;
        let features = FeatureVector::from_profile(&profile);

        let base_probability = self
            .model
            .score(&features)
            .await
            .with_context(|| format!("scoring features for '{player_name}'"))?;

        let articles = self
            .feed
            .recent_summaries(player_name, self.article_cap)
            .await
            .with_context(|| format!("fetching news for '{player_name}'"))?;

        let bundle = self.classifier.classify(&articles).await;
        let transfer_chance = Self::fuse(self.fusion_weight, base_probability, bundle.overall);

        info!(
            player = player_name,
            base_probability,
            text_score = bundle.overall,
            transfer_chance,
            "scored"
        );
        Ok(Scored {
            base_probability,
            text_score: bundle.overall,
            transfer_chance,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub archive_prefix: String,
    pub threshold: f64,
    /// Resume the archive sweep at this key, skipping earlier files.
    pub from_key: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            archive_prefix: "crawl/archive/".to_string(),
            threshold: 0.6,
            from_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileAccuracy {
    pub key: String,
    pub rows_scored: usize,
    pub rows_skipped: usize,
    pub correct: usize,
}

impl FileAccuracy {
    pub fn accuracy(&self) -> Option<f64> {
        if self.rows_scored == 0 {
            None
        } else {
            Some(self.correct as f64 / self.rows_scored as f64)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacktestReport {
    pub files: Vec<FileAccuracy>,
}

/// Replays archived partitions through the scorer and compares thresholded
/// predictions against the stored label. A row that fails to score is
/// reported and excluded, never fatal.
pub struct BacktestRunner {
    store: Arc<dyn ObjectStore>,
    scorer: EnsembleScorer,
    config: BacktestConfig,
}

impl BacktestRunner {
    pub fn new(store: Arc<dyn ObjectStore>, scorer: EnsembleScorer, config: BacktestConfig) -> Self {
        Self {
            store,
            scorer,
            config,
        }
    }

    pub async fn run_once(&self) -> Result<BacktestReport> {
        let keys = self
            .store
            .list(&self.config.archive_prefix)
            .await
            .context("listing archived partitions")?;

        let mut resume = self.config.from_key.is_none();
        let mut report = BacktestReport::default();

        for key in keys {
            if !key.to_ascii_lowercase().ends_with(".csv") {
                continue;
            }
            if !resume {
                if Some(&key) != self.config.from_key.as_ref() {
                    info!(key = key.as_str(), "skipped (before resume key)");
                    continue;
                }
                resume = true;
            }

            let accuracy = self.run_file(&key).await?;
            report.files.push(accuracy);
        }

        Ok(report)
    }

    async fn run_file(&self, key: &str) -> Result<FileAccuracy> {
        let bytes = self
            .store
            .get(key)
            .await
            .with_context(|| format!("reading archived partition {key}"))?;
        let text =
            String::from_utf8(bytes).with_context(|| format!("partition {key} is not utf-8"))?;

        let mut lines = text.lines();
        let header = lines.next().unwrap_or_default();
        let name_idx = column_index(header, "name")
            .with_context(|| format!("partition {key} has no name column"))?;
        let label_idx = column_index(header, "transfer")
            .with_context(|| format!("partition {key} has no transfer column"))?;

        let mut accuracy = FileAccuracy {
            key: key.to_string(),
            rows_scored: 0,
            rows_skipped: 0,
            correct: 0,
        };

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_csv_line(line);
            let (Some(name), Some(label)) = (fields.get(name_idx), fields.get(label_idx)) else {
                accuracy.rows_skipped += 1;
                continue;
            };
            let Ok(actual) = label.parse::<u8>() else {
                accuracy.rows_skipped += 1;
                continue;
            };

            match self.scorer.score(name).await {
                Ok(scored) => {
                    let predicted = u8::from(scored.transfer_chance >= self.config.threshold);
                    accuracy.rows_scored += 1;
                    if predicted == actual {
                        accuracy.correct += 1;
                    }
                    info!(
                        player = name.as_str(),
                        prob = scored.transfer_chance,
                        predicted,
                        actual,
                        "backtest row"
                    );
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    warn!(player = name.as_str(), error = reason.as_str(), "row skipped");
                    accuracy.rows_skipped += 1;
                }
            }
        }

        Ok(accuracy)
    }
}

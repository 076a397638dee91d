//! Axum prediction boundary for Transferlens.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tl_predict::EnsembleScorer;
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "tl-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("TL_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(Self::default().port),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub scorer: Arc<EnsembleScorer>,
}

impl AppState {
    pub fn new(scorer: Arc<EnsembleScorer>) -> Self {
        Self { scorer }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PredictQuery {
    player_name: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/predict", get(predict_handler).options(preflight_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, config: WebConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, "prediction api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Preflight answer: permissive headers, no body.
async fn preflight_handler() -> Response {
    with_cors(StatusCode::OK.into_response())
}

async fn predict_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PredictQuery>,
) -> Response {
    let Some(player_name) = query.player_name.filter(|name| !name.trim().is_empty()) else {
        return with_cors(
            (
                StatusCode::BAD_REQUEST,
                "Missing 'player_name' in query string",
            )
                .into_response(),
        );
    };

    match state.scorer.score(&player_name).await {
        Ok(scored) => with_cors(
            Json(serde_json::json!({
                "player_name": player_name,
                "transfer_chance": scored.transfer_chance,
            }))
            .into_response(),
        ),
        Err(err) => with_cors(
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Server error: {err}"),
            )
                .into_response(),
        ),
    }
}

fn with_cors(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("*"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tl_adapters::{AdapterError, NewsFeed, ProfileLookup};
    use tl_core::{FeatureVector, PlayerProfile};
    use tl_predict::{
        ChatCompletion, ChatOutcome, ChatRequest, LlmError, ModelError, PredictConfig, ScoreModel,
        TransferClassifier,
    };
    use tower::ServiceExt;

    struct StubProfile {
        fail: bool,
    }

    #[async_trait]
    impl ProfileLookup for StubProfile {
        async fn lookup(&self, player_name: &str) -> Result<PlayerProfile, AdapterError> {
            if self.fail {
                return Err(AdapterError::Message("search backend down".to_string()));
            }
            Ok(PlayerProfile {
                name: Some(player_name.to_string()),
                ..Default::default()
            })
        }
    }

    struct StubModel;

    #[async_trait]
    impl ScoreModel for StubModel {
        async fn score(&self, _features: &FeatureVector) -> Result<f64, ModelError> {
            Ok(0.8)
        }
    }

    struct EmptyFeed;

    #[async_trait]
    impl NewsFeed for EmptyFeed {
        async fn recent_summaries(
            &self,
            _player_name: &str,
            _cap: usize,
        ) -> Result<Vec<String>, AdapterError> {
            Ok(Vec::new())
        }
    }

    struct NeverChat;

    #[async_trait]
    impl ChatCompletion for NeverChat {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatOutcome, LlmError> {
            Err(LlmError::EmptyChoices)
        }
    }

    fn test_app(fail_lookup: bool) -> Router {
        let classifier =
            TransferClassifier::new(Box::new(NeverChat), &PredictConfig::default());
        let scorer = EnsembleScorer::new(
            Box::new(StubProfile { fail: fail_lookup }),
            Box::new(StubModel),
            Box::new(EmptyFeed),
            classifier,
            0.1,
            5,
        );
        app(AppState::new(Arc::new(scorer)))
    }

    #[tokio::test]
    async fn missing_player_name_is_a_bad_request() {
        let resp = test_app(false)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/predict")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN]
                .to_str()
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn preflight_gets_permissive_headers_and_no_body() {
        let resp = test_app(false)
            .oneshot(
                axum::http::Request::builder()
                    .method("OPTIONS")
                    .uri("/predict")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
                .to_str()
                .unwrap(),
            "*"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn prediction_returns_name_and_chance() {
        let resp = test_app(false)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/predict?player_name=Vini%20Jr.")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN]
                .to_str()
                .unwrap(),
            "*"
        );

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["player_name"], "Vini Jr.");
        // no articles → 0.1 * 0.8
        let chance = value["transfer_chance"].as_f64().unwrap();
        assert!((chance - 0.08).abs() < 1e-12);
    }

    #[tokio::test]
    async fn lookup_failure_surfaces_as_server_error() {
        let resp = test_app(true)
            .oneshot(
                axum::http::Request::builder()
                    .uri("/predict?player_name=Anyone")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("Server error:"));
    }
}

//! Axum JSON API for News Hub: the article query service and the manual
//! ingestion trigger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use newshub_core::{is_home_query, Article, RECENT_LIMIT};
use newshub_storage::{ArticleStore, StoreError};
use newshub_sync::IngestionJob;
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "newshub-web";

#[derive(Clone)]
pub struct WebConfig {
    pub port: u16,
    pub trigger_secret: Option<String>,
    pub cors_origins: Vec<String>,
}

impl std::fmt::Debug for WebConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebConfig")
            .field("port", &self.port)
            .field("trigger_secret_set", &self.trigger_secret.is_some())
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5001),
            trigger_secret: std::env::var("TRIGGER_SECRET")
                .ok()
                .filter(|v| !v.is_empty()),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ArticleStore>,
    pub job: Arc<IngestionJob>,
    pub trigger_secret: Option<String>,
}

impl AppState {
    pub fn new(store: Arc<dyn ArticleStore>, job: Arc<IngestionJob>, trigger_secret: Option<String>) -> Self {
        Self {
            store,
            job,
            trigger_secret,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("store failure: {0}")]
    Internal(#[from] StoreError),
    #[error("trigger secret rejected")]
    Unauthorized,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Internal(err) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": "Internal server error" })),
                )
                    .into_response()
            }
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "Unauthorized" })),
            )
                .into_response(),
        }
    }
}

/// Front page (absent, empty, or `home`) yields the newest articles across all
/// categories; any other value is an exact category match.
pub async fn list_articles(store: &dyn ArticleStore, category: Option<&str>) -> Result<Vec<Article>, ApiError> {
    let articles = match category {
        Some(category) if !is_home_query(Some(category)) => store.list_by_category(category).await?,
        _ => store.list_recent(RECENT_LIMIT).await?,
    };
    Ok(articles)
}

#[derive(Debug, Deserialize, Default)]
struct ArticlesQuery {
    category: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TriggerQuery {
    secret: Option<String>,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let allowed = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    layer.allow_origin(AllowOrigin::list(allowed))
}

pub fn app(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/articles", get(articles_handler))
        .route("/api/trigger-fetch", get(trigger_fetch_handler))
        .route("/healthz", get(healthz_handler))
        .layer(cors_layer(cors_origins))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let addr: SocketAddr = listener.local_addr()?;
    info!(%addr, "backend server listening");
    axum::serve(listener, app(state, &config.cors_origins))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn articles_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArticlesQuery>,
) -> Result<Json<Vec<Article>>, ApiError> {
    let articles = list_articles(state.store.as_ref(), query.category.as_deref()).await?;
    Ok(Json(articles))
}

async fn trigger_fetch_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TriggerQuery>,
) -> Result<Response, ApiError> {
    if !secret_matches(state.trigger_secret.as_deref(), query.secret.as_deref()) {
        warn!("manual fetch rejected: bad or missing secret");
        return Err(ApiError::Unauthorized);
    }

    // Detached; the run reports through its own logs.
    drop(state.job.trigger());
    info!("manual fetch started");
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
        .into_response())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable").into_response()
        }
    }
}

/// No configured secret means the trigger is closed.
fn secret_matches(expected: Option<&str>, presented: Option<&str>) -> bool {
    let (Some(expected), Some(presented)) = (expected, presented) else {
        return false;
    };
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    // Fold over every byte so timing does not reveal the matching prefix.
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use newshub_adapters::{NewsSource, RawArticle, UpstreamError};
    use newshub_core::NewArticle;
    use newshub_storage::MemoryArticleStore;
    use newshub_sync::IngestConfig;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret";

    /// Blocks every search until released, counting calls.
    struct GatedSource {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    impl GatedSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Notify::new(),
                release: Notify::new(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NewsSource for GatedSource {
        fn source_id(&self) -> &'static str {
            "gated"
        }

        async fn search(&self, _topic: &str) -> Result<Vec<RawArticle>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(vec![RawArticle::from_value(serde_json::json!({
                "url": "https://example.com/triggered",
                "title": "Triggered",
                "publishedAt": "2024-05-01T00:00:00Z"
            }))])
        }
    }

    struct DownStore;

    #[async_trait]
    impl ArticleStore for DownStore {
        async fn init_schema(&self) -> Result<(), StoreError> {
            Err(StoreError::Config("down".into()))
        }

        async fn find_by_url(&self, _url: &str) -> Result<Option<Article>, StoreError> {
            Err(StoreError::Config("down".into()))
        }

        async fn insert_if_absent(&self, _article: NewArticle) -> Result<Option<i64>, StoreError> {
            Err(StoreError::Config("down".into()))
        }

        async fn list_by_category(&self, _category: &str) -> Result<Vec<Article>, StoreError> {
            Err(StoreError::Config("connection refused to db.internal".into()))
        }

        async fn list_recent(&self, _limit: i64) -> Result<Vec<Article>, StoreError> {
            Err(StoreError::Config("connection refused to db.internal".into()))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Config("down".into()))
        }
    }

    fn new_article(url: &str, category: &str, minutes: i64) -> NewArticle {
        NewArticle {
            title: format!("Title {url}"),
            url: url.to_string(),
            source: Some("Wire".into()),
            description: None,
            content: None,
            image_url: None,
            category: category.to_string(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap()
                + chrono::Duration::minutes(minutes),
        }
    }

    fn state_with(store: Arc<dyn ArticleStore>, source: Arc<GatedSource>) -> AppState {
        let config = IngestConfig::new("india", Vec::<String>::new()).unwrap();
        let job = Arc::new(IngestionJob::new(config, source, store.clone()));
        AppState::new(store, job, Some(SECRET.to_string()))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn seeded_store() -> Arc<MemoryArticleStore> {
        let store = Arc::new(MemoryArticleStore::new());
        for i in 0..120 {
            let category = match i % 3 {
                0 => "technology",
                1 => "general",
                _ => "sports",
            };
            store
                .insert_if_absent(new_article(&format!("u{i}"), category, i))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn home_listing_returns_newest_hundred() {
        let store = seeded_store().await;
        let app = app(state_with(store, GatedSource::new()), &[]);

        for uri in ["/api/articles", "/api/articles?category=home", "/api/articles?category="] {
            let (status, body) = get(app.clone(), uri).await;
            assert_eq!(status, StatusCode::OK);
            let articles: Vec<Article> = serde_json::from_slice(&body).unwrap();
            assert_eq!(articles.len(), 100, "{uri}");
            assert_eq!(articles[0].url, "u119");
            assert!(articles.windows(2).all(|w| w[0].published_at >= w[1].published_at));
        }
    }

    #[tokio::test]
    async fn category_listing_filters_exactly() {
        let store = seeded_store().await;
        let app = app(state_with(store, GatedSource::new()), &[]);

        let (status, body) = get(app.clone(), "/api/articles?category=technology").await;
        assert_eq!(status, StatusCode::OK);
        let articles: Vec<Article> = serde_json::from_slice(&body).unwrap();
        assert_eq!(articles.len(), 40);
        assert!(articles.iter().all(|a| a.category == "technology"));
        assert!(articles.windows(2).all(|w| w[0].published_at >= w[1].published_at));

        let (status, body) = get(app, "/api/articles?category=astrology").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn store_failure_is_opaque_500() {
        let app = app(state_with(Arc::new(DownStore), GatedSource::new()), &[]);
        let (status, body) = get(app.clone(), "/api/articles?category=science").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("Internal server error"));
        assert!(!text.contains("db.internal"));

        let (status, _) = get(app, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn trigger_rejects_missing_or_wrong_secret_without_running() {
        let source = GatedSource::new();
        let store = Arc::new(MemoryArticleStore::new());
        let app = app(state_with(store, source.clone()), &[]);

        for uri in ["/api/trigger-fetch", "/api/trigger-fetch?secret=nope", "/api/trigger-fetch?secret="] {
            let (status, _) = get(app.clone(), uri).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_is_closed_when_no_secret_is_configured() {
        let source = GatedSource::new();
        let store: Arc<dyn ArticleStore> = Arc::new(MemoryArticleStore::new());
        let mut state = state_with(store, source.clone());
        state.trigger_secret = None;

        let (status, _) = get(app(state, &[]), "/api/trigger-fetch?secret=").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_accepts_before_the_run_finishes() {
        let source = GatedSource::new();
        let store = Arc::new(MemoryArticleStore::new());
        let app = app(state_with(store.clone(), source.clone()), &[]);

        let (status, body) = get(app, &format!("/api/trigger-fetch?secret={SECRET}")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(String::from_utf8(body).unwrap().contains("accepted"));

        // The run is parked inside the upstream call, so nothing is stored yet.
        source.entered.notified().await;
        assert!(store.is_empty().await);

        source.release.notify_one();
        for _ in 0..100 {
            if store.len().await == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("triggered run never stored its article");
    }

    #[tokio::test]
    async fn cors_allows_configured_origin() {
        let store = Arc::new(MemoryArticleStore::new());
        let origins = vec!["http://localhost:5173".to_string()];
        let app = app(state_with(store, GatedSource::new()), &origins);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/articles")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN].to_str().unwrap(),
            "http://localhost:5173"
        );
    }

    #[test]
    fn secret_comparison_requires_exact_match() {
        assert!(secret_matches(Some("abc"), Some("abc")));
        assert!(!secret_matches(Some("abc"), Some("abd")));
        assert!(!secret_matches(Some("abc"), Some("abcd")));
        assert!(!secret_matches(Some("abc"), None));
        assert!(!secret_matches(None, Some("abc")));
    }
}

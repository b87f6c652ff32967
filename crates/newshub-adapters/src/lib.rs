//! Upstream news provider contract and the NewsAPI `/everything` client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "newshub-adapters";

pub const NEWSAPI_BASE_URL: &str = "https://newsapi.org/v2";

/// One article as the provider returned it. Nothing about its shape is
/// trusted; every accessor checks presence and type before extracting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawArticle {
    value: JsonValue,
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    cur.as_str()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

impl RawArticle {
    pub fn from_value(value: JsonValue) -> Self {
        Self { value }
    }

    pub fn url(&self) -> Option<&str> {
        non_blank(json_str(&self.value, &["url"]))
    }

    pub fn title(&self) -> Option<&str> {
        non_blank(json_str(&self.value, &["title"]))
    }

    pub fn source_name(&self) -> Option<&str> {
        non_blank(json_str(&self.value, &["source", "name"]))
    }

    pub fn description(&self) -> Option<&str> {
        json_str(&self.value, &["description"])
    }

    pub fn content(&self) -> Option<&str> {
        json_str(&self.value, &["content"])
    }

    pub fn image_url(&self) -> Option<&str> {
        non_blank(json_str(&self.value, &["urlToImage"]))
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        json_str(&self.value, &["publishedAt"]).and_then(parse_published_at)
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS` (taken as UTC), or a bare date
/// (midnight UTC).
pub fn parse_published_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailureKind {
    /// The account plan forbids server-side requests (HTTP 426).
    TierRestricted,
    RateLimited,
    Unauthorized,
    Transport,
    Other,
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned http {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("upstream rejected request ({code}): {message}")]
    Api { code: String, message: String },
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("upstream response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

impl UpstreamError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Status { code, .. } => code.as_deref(),
            Self::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn kind(&self) -> UpstreamFailureKind {
        if let Self::Transport(_) = self {
            return UpstreamFailureKind::Transport;
        }
        match (self.status_code(), self.provider_code()) {
            (Some(426), _) => UpstreamFailureKind::TierRestricted,
            (Some(429), _) | (_, Some("rateLimited")) => UpstreamFailureKind::RateLimited,
            (Some(401), _) | (_, Some("apiKeyInvalid" | "apiKeyMissing")) => {
                UpstreamFailureKind::Unauthorized
            }
            _ => UpstreamFailureKind::Other,
        }
    }
}

/// A provider that can be searched by topic keyword.
#[async_trait]
pub trait NewsSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// One outbound request, no retries. Articles come back in provider order.
    async fn search(&self, topic: &str) -> Result<Vec<RawArticle>, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Clone)]
pub struct NewsApiConfig {
    pub base_url: String,
    pub api_key: String,
    pub http: HttpClientConfig,
}

impl std::fmt::Debug for NewsApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewsApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key_set", &!self.api_key.is_empty())
            .field("http", &self.http)
            .finish()
    }
}

impl NewsApiConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("NEWS_API_BASE_URL")
                .unwrap_or_else(|_| NEWSAPI_BASE_URL.to_string()),
            api_key: std::env::var("NEWS_API_KEY").unwrap_or_default(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(
                    std::env::var("NEWSHUB_HTTP_TIMEOUT_SECS")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(20),
                ),
                user_agent: Some(
                    std::env::var("NEWSHUB_USER_AGENT")
                        .unwrap_or_else(|_| "newshub/0.1".to_string()),
                ),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct NewsApiEnvelope {
    status: Option<String>,
    code: Option<String>,
    message: Option<String>,
    #[serde(default)]
    articles: Option<Vec<JsonValue>>,
}

pub struct NewsApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl NewsApiClient {
    pub fn new(config: NewsApiConfig) -> Result<Self, UpstreamError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.http.timeout);

        if let Some(user_agent) = &config.http.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| UpstreamError::Transport(err.without_url()))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
        })
    }

    fn everything_url(&self) -> String {
        format!("{}/everything", self.base_url)
    }
}

#[async_trait]
impl NewsSource for NewsApiClient {
    fn source_id(&self) -> &'static str {
        "newsapi"
    }

    async fn search(&self, topic: &str) -> Result<Vec<RawArticle>, UpstreamError> {
        let resp = self
            .client
            .get(self.everything_url())
            .header("X-Api-Key", &self.api_key)
            .query(&[("q", topic), ("language", "en"), ("sortBy", "publishedAt")])
            .send()
            .await
            .map_err(|err| UpstreamError::Transport(err.without_url()))?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .map_err(|err| UpstreamError::Transport(err.without_url()))?;

        if !status.is_success() {
            let envelope = serde_json::from_slice::<NewsApiEnvelope>(&body).ok();
            let (code, message) = match envelope {
                Some(env) => (env.code, env.message),
                None => (None, None),
            };
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                code,
                message: message.unwrap_or_else(|| {
                    status.canonical_reason().unwrap_or("unknown error").to_string()
                }),
            });
        }

        let envelope: NewsApiEnvelope = serde_json::from_slice(&body)?;
        if envelope.status.as_deref() != Some("ok") {
            return Err(UpstreamError::Api {
                code: envelope.code.unwrap_or_else(|| "unknown".to_string()),
                message: envelope.message.unwrap_or_else(|| "unknown error".to_string()),
            });
        }

        let articles = envelope
            .articles
            .unwrap_or_default()
            .into_iter()
            .map(RawArticle::from_value)
            .collect::<Vec<_>>();
        debug!(topic, count = articles.len(), "upstream search returned");
        Ok(articles)
    }
}

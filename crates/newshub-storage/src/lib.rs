//! Article persistence for News Hub: the store contract plus Postgres and
//! in-memory implementations.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use newshub_core::{Article, NewArticle};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "newshub-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid database configuration: {0}")]
    Config(String),
}

/// Storage contract consumed by the ingestion job and the query service.
#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Idempotent; safe on every process start.
    async fn init_schema(&self) -> Result<(), StoreError>;

    async fn find_by_url(&self, url: &str) -> Result<Option<Article>, StoreError>;

    /// Inserts unless an article with the same url exists. Returns the new id,
    /// or `None` when the url was already stored.
    async fn insert_if_absent(&self, article: NewArticle) -> Result<Option<i64>, StoreError>;

    /// Articles in `category`, newest `published_at` first.
    async fn list_by_category(&self, category: &str) -> Result<Vec<Article>, StoreError>;

    /// The `limit` newest articles across every category.
    async fn list_recent(&self, limit: i64) -> Result<Vec<Article>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct StoreConfig {
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5432),
            user: std::env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("DB_PASSWORD").unwrap_or_default(),
            database: std::env::var("DB_DATABASE").unwrap_or_else(|_| "newshub".to_string()),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }

    /// `DATABASE_URL` wins over the individual `DB_*` parts.
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        if let Some(url) = &self.database_url {
            return url
                .parse::<PgConnectOptions>()
                .map_err(|err| StoreError::Config(err.to_string()));
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        Ok(options)
    }
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        id BIGSERIAL PRIMARY KEY,
        title TEXT NOT NULL,
        url TEXT NOT NULL UNIQUE,
        source TEXT,
        description TEXT,
        content TEXT,
        image_url TEXT,
        category VARCHAR(50) NOT NULL,
        published_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS articles_category_published_idx ON articles (category, published_at DESC)",
    "CREATE INDEX IF NOT EXISTS articles_published_idx ON articles (published_at DESC)",
];

// Casts keep reads working against tables created with SERIAL ids.
const ARTICLE_COLUMNS: &str = "id::BIGINT AS id, title, url, source, description, content, \
     image_url, category, published_at, created_at";

#[derive(Debug, Clone)]
pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options()?)
            .await?;
        Ok(Self { pool })
    }
}

fn article_from_row(row: &PgRow) -> Result<Article, sqlx::Error> {
    Ok(Article {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        source: row.try_get("source")?,
        description: row.try_get("description")?,
        content: row.try_get("content")?,
        image_url: row.try_get("image_url")?,
        category: row.try_get("category")?,
        published_at: row.try_get("published_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("articles table ready");
        Ok(())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE url = $1"))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(article_from_row).transpose()?)
    }

    async fn insert_if_absent(&self, article: NewArticle) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO articles (title, url, source, description, content, image_url, category, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (url) DO NOTHING
            RETURNING id::BIGINT AS id
            "#,
        )
        .bind(&article.title)
        .bind(&article.url)
        .bind(&article.source)
        .bind(&article.description)
        .bind(&article.content)
        .bind(&article.image_url)
        .bind(&article.category)
        .bind(article.published_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("id")?)),
            None => {
                debug!(url = %article.url, "insert skipped, url already stored");
                Ok(None)
            }
        }
    }

    async fn list_by_category(&self, category: &str) -> Result<Vec<Article>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles WHERE category = $1 ORDER BY published_at DESC, id DESC"
        ))
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(article_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Article>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles ORDER BY published_at DESC, id DESC LIMIT $1"
        ))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(article_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Process-local store with the same uniqueness and ordering rules as the
/// Postgres table.
#[derive(Debug, Default)]
pub struct MemoryArticleStore {
    state: RwLock<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    rows: Vec<Article>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Article> {
        self.state.read().await.rows.clone()
    }
}

fn newest_first(mut rows: Vec<Article>) -> Vec<Article> {
    rows.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    rows
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        let state = self.state.read().await;
        Ok(state.rows.iter().find(|a| a.url == url).cloned())
    }

    async fn insert_if_absent(&self, article: NewArticle) -> Result<Option<i64>, StoreError> {
        let mut state = self.state.write().await;
        if state.rows.iter().any(|a| a.url == article.url) {
            return Ok(None);
        }
        state.last_id += 1;
        let id = state.last_id;
        let created_at: DateTime<Utc> = Utc::now();
        state.rows.push(article.into_article(id, created_at));
        Ok(Some(id))
    }

    async fn list_by_category(&self, category: &str) -> Result<Vec<Article>, StoreError> {
        let state = self.state.read().await;
        let rows = state
            .rows
            .iter()
            .filter(|a| a.category == category)
            .cloned()
            .collect::<Vec<_>>();
        Ok(newest_first(rows))
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<Article>, StoreError> {
        let state = self.state.read().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(newest_first(state.rows.clone()).into_iter().take(limit).collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

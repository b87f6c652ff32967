//! Ingestion job: pulls each configured topic from the upstream provider and
//! stores articles the store has not seen yet.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use newshub_adapters::{NewsSource, RawArticle, UpstreamError, UpstreamFailureKind};
use newshub_core::{NewArticle, GENERAL_CATEGORY, REMOVED_TITLE};
use newshub_storage::{ArticleStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newshub-sync";

pub const DEFAULT_HOME_TOPIC: &str = "india";
pub const DEFAULT_CATEGORIES: &[&str] = &["technology", "business", "sports", "science", "health"];

/// Minute 0 of every hour (seconds-first cron).
pub const DEFAULT_SYNC_CRON: &str = "0 0 * * * *";

// Matches the width of the `category` column.
const MAX_CATEGORY_LEN: usize = 50;

/// Immutable topic configuration handed to [`IngestionJob::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub home_topic: String,
    pub categories: Vec<String>,
    #[serde(default = "default_general_label")]
    pub general_label: String,
}

fn default_general_label() -> String {
    GENERAL_CATEGORY.to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            home_topic: DEFAULT_HOME_TOPIC.to_string(),
            categories: DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect(),
            general_label: default_general_label(),
        }
    }
}

impl IngestConfig {
    pub fn new(
        home_topic: impl Into<String>,
        categories: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self> {
        let config = Self {
            home_topic: home_topic.into(),
            categories: categories.into_iter().map(Into::into).collect(),
            general_label: default_general_label(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing topic registry")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Topic file when one is given, built-in topics otherwise.
    pub fn load(topics_file: Option<&Path>) -> Result<Self> {
        match topics_file {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.home_topic.trim().is_empty() {
            bail!("home topic must not be empty");
        }
        if self.general_label.trim().is_empty() || self.general_label.len() > MAX_CATEGORY_LEN {
            bail!("general label must be 1..={MAX_CATEGORY_LEN} bytes");
        }
        let mut seen = HashSet::new();
        for category in &self.categories {
            if category.trim().is_empty() || category.len() > MAX_CATEGORY_LEN {
                bail!("category {category:?} must be 1..={MAX_CATEGORY_LEN} bytes");
            }
            if category == &self.home_topic || category == &self.general_label {
                bail!("category {category:?} collides with the home topic or general label");
            }
            if !seen.insert(category.as_str()) {
                bail!("category {category:?} is listed twice");
            }
        }
        Ok(())
    }

    /// Home topic first, then categories in configured order.
    pub fn topic_sequence(&self) -> Vec<&str> {
        std::iter::once(self.home_topic.as_str())
            .chain(self.categories.iter().map(String::as_str))
            .collect()
    }

    pub fn category_for<'a>(&'a self, topic: &'a str) -> &'a str {
        if topic == self.home_topic {
            &self.general_label
        } else {
            topic
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub topics_file: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            scheduler_enabled: std::env::var("NEWSHUB_SCHEDULER_ENABLED")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            sync_cron: std::env::var("NEWSHUB_SYNC_CRON")
                .unwrap_or_else(|_| DEFAULT_SYNC_CRON.to_string()),
            topics_file: std::env::var("NEWSHUB_TOPICS_FILE").ok().map(PathBuf::from),
        }
    }

    pub fn ingest_config(&self) -> Result<IngestConfig> {
        IngestConfig::load(self.topics_file.as_deref())
    }
}

/// Why a raw upstream record was dropped before reaching the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingUrl,
    MissingTitle,
    RemovedByUpstream,
    MissingPublishedAt,
}

/// Turns a raw record into an insert payload for `category`, or says why it
/// must not be stored.
pub fn candidate(raw: &RawArticle, category: &str) -> Result<NewArticle, SkipReason> {
    let url = raw.url().ok_or(SkipReason::MissingUrl)?;
    let title = raw.title().ok_or(SkipReason::MissingTitle)?;
    if title == REMOVED_TITLE {
        return Err(SkipReason::RemovedByUpstream);
    }
    let published_at = raw.published_at().ok_or(SkipReason::MissingPublishedAt)?;
    Ok(NewArticle {
        title: title.to_string(),
        url: url.to_string(),
        source: raw.source_name().map(ToString::to_string),
        description: raw.description().map(ToString::to_string),
        content: raw.content().map(ToString::to_string),
        image_url: raw.image_url().map(ToString::to_string),
        category: category.to_string(),
        published_at,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicReport {
    pub topic: String,
    pub category: String,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
    pub upstream_error: Option<String>,
}

impl TopicReport {
    fn new(topic: &str, category: &str) -> Self {
        Self {
            topic: topic.to_string(),
            category: category.to_string(),
            fetched: 0,
            inserted: 0,
            duplicates: 0,
            skipped: 0,
            failed: 0,
            upstream_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub topics: Vec<TopicReport>,
}

impl RunSummary {
    pub fn inserted(&self) -> usize {
        self.topics.iter().map(|t| t.inserted).sum()
    }

    pub fn failed_topics(&self) -> usize {
        self.topics.iter().filter(|t| t.upstream_error.is_some()).count()
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// Another run held the guard; nothing was fetched or written.
    AlreadyRunning,
}

enum StoreOutcome {
    Inserted(i64),
    Duplicate,
}

pub struct IngestionJob {
    config: IngestConfig,
    source: Arc<dyn NewsSource>,
    store: Arc<dyn ArticleStore>,
    run_guard: Mutex<()>,
}

impl IngestionJob {
    pub fn new(config: IngestConfig, source: Arc<dyn NewsSource>, store: Arc<dyn ArticleStore>) -> Self {
        Self {
            config,
            source,
            store,
            run_guard: Mutex::new(()),
        }
    }

    /// One pass over every topic. At most one pass runs per job at a time; an
    /// overlapping call returns [`RunOutcome::AlreadyRunning`] immediately.
    pub async fn run_once(&self) -> RunOutcome {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("ingestion run already in progress; skipping this trigger");
            return RunOutcome::AlreadyRunning;
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.source_id());
        async move {
            let started_at = Utc::now();
            info!("starting news fetch for all topics");

            let mut topics = Vec::new();
            for topic in self.config.topic_sequence() {
                let report = self
                    .ingest_topic(topic)
                    .instrument(info_span!("ingest_topic", topic))
                    .await;
                topics.push(report);
            }

            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                topics,
            };
            info!(
                inserted = summary.inserted(),
                failed_topics = summary.failed_topics(),
                "finished news fetch for all topics"
            );
            RunOutcome::Completed(summary)
        }
        .instrument(span)
        .await
    }

    /// Starts a run on the runtime and returns without waiting for it.
    pub fn trigger(self: &Arc<Self>) -> JoinHandle<RunOutcome> {
        let job = Arc::clone(self);
        tokio::spawn(async move { job.run_once().await })
    }

    async fn ingest_topic(&self, topic: &str) -> TopicReport {
        let category = self.config.category_for(topic);
        let mut report = TopicReport::new(topic, category);

        let articles = match self.source.search(topic).await {
            Ok(articles) => articles,
            Err(err) => {
                log_upstream_failure(topic, &err);
                report.upstream_error = Some(err.to_string());
                return report;
            }
        };
        report.fetched = articles.len();

        for raw in &articles {
            let article = match candidate(raw, category) {
                Ok(article) => article,
                Err(reason) => {
                    debug!(?reason, url = raw.url().unwrap_or_default(), "skipping upstream article");
                    report.skipped += 1;
                    continue;
                }
            };

            let url = article.url.clone();
            match self.store_new(article).await {
                Ok(StoreOutcome::Inserted(id)) => {
                    debug!(id, %url, "stored article");
                    report.inserted += 1;
                }
                Ok(StoreOutcome::Duplicate) => report.duplicates += 1,
                Err(err) => {
                    error!(%url, error = %err, "failed to store article; continuing");
                    report.failed += 1;
                }
            }
        }

        info!(
            fetched = report.fetched,
            inserted = report.inserted,
            duplicates = report.duplicates,
            skipped = report.skipped,
            failed = report.failed,
            "stored articles for topic"
        );
        report
    }

    async fn store_new(&self, article: NewArticle) -> Result<StoreOutcome, StoreError> {
        if self.store.find_by_url(&article.url).await?.is_some() {
            return Ok(StoreOutcome::Duplicate);
        }
        // The conditional insert covers a writer that landed after the lookup.
        Ok(match self.store.insert_if_absent(article).await? {
            Some(id) => StoreOutcome::Inserted(id),
            None => StoreOutcome::Duplicate,
        })
    }
}

fn log_upstream_failure(topic: &str, err: &UpstreamError) {
    let status = err.status_code();
    match err.kind() {
        UpstreamFailureKind::TierRestricted => warn!(
            topic,
            ?status,
            error = %err,
            "upstream plan does not allow server-side requests; topic skipped"
        ),
        UpstreamFailureKind::RateLimited => {
            warn!(topic, ?status, error = %err, "upstream rate limit hit; topic skipped")
        }
        UpstreamFailureKind::Unauthorized => {
            warn!(topic, ?status, error = %err, "upstream rejected the api key; topic skipped")
        }
        UpstreamFailureKind::Transport | UpstreamFailureKind::Other => {
            warn!(topic, ?status, error = %err, "error fetching news for topic; topic skipped")
        }
    }
}

/// Builds the recurring scheduler. Returns `None` when scheduling is disabled.
/// The caller starts it.
pub async fn build_scheduler(job: Arc<IngestionJob>, config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let scheduled = Job::new_async(cron, move |_uuid, _l| {
        let job = Arc::clone(&job);
        Box::pin(async move {
            job.run_once().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(scheduled).await.context("adding scheduler job")?;
    info!(cron, "ingestion scheduled");
    Ok(Some(sched))
}

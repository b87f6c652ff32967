//! Core domain model for News Hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "newshub-core";

/// Title the upstream provider substitutes for articles it has taken down.
pub const REMOVED_TITLE: &str = "[Removed]";

/// Query value the browsing client sends for the front page.
pub const HOME_CATEGORY: &str = "home";

/// Storage label for articles fetched under the home-page topic.
pub const GENERAL_CATEGORY: &str = "general";

/// Cap on the front-page listing.
pub const RECENT_LIMIT: i64 = 100;

/// Persisted article as returned by the store and served to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub category: String,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload handed from the ingestion job to the store. `id` and
/// `created_at` are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArticle {
    pub title: String,
    pub url: String,
    pub source: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub category: String,
    pub published_at: DateTime<Utc>,
}

impl NewArticle {
    pub fn into_article(self, id: i64, created_at: DateTime<Utc>) -> Article {
        Article {
            id,
            title: self.title,
            url: self.url,
            source: self.source,
            description: self.description,
            content: self.content,
            image_url: self.image_url,
            category: self.category,
            published_at: self.published_at,
            created_at,
        }
    }
}

/// True when the query value asks for the cross-category front page.
pub fn is_home_query(category: Option<&str>) -> bool {
    match category.map(str::trim) {
        None => true,
        Some(value) => value.is_empty() || value == HOME_CATEGORY,
    }
}

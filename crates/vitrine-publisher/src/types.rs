use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A piece of manageable content with a publish flag and an optional
/// scheduled release time.
///
/// Rows are owned by the content CRUD layer; this crate only reads these
/// fields and flips `published` from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentItem {
    pub id: String,
    #[serde(rename = "publicationState")]
    pub published: bool,
    /// `None` means the item is never published automatically.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContentItem {
    /// Draft, scheduled, and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.published && self.scheduled_at.is_some_and(|at| at <= now)
    }
}

/// Input for creating a draft item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContentItem {
    /// Generated (UUID v4) when absent.
    pub id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewContentItem {
    pub fn scheduled(at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            scheduled_at: Some(at),
        }
    }

    pub fn unscheduled() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

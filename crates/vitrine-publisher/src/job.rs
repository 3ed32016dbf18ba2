use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::connection::ConnectionManager;
use crate::error::{PublishError, StoreError};
use crate::store::ContentStore;
use crate::types::ContentItem;

/// Source of "now" for a publication run.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Outcome of one publication run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    /// Rows this run flipped, not a read-time estimate.
    pub updated_count: usize,
    pub ids: Vec<String>,
    pub ran_at: DateTime<Utc>,
}

/// Read-only view of what the next run would do.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub due: u64,
    pub items: Vec<ContentItem>,
    pub checked_at: DateTime<Utc>,
}

/// A unit of work the [`crate::trigger::Trigger`] drives on a cadence.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self) -> Result<PublishReport, PublishError>;
}

/// Promotes overdue drafts to published.
///
/// Stateless between runs: every call acquires the shared store handle and
/// issues one predicate-scoped update, so overlapping runs (in this process
/// or another one on the same database) never double-count an item.
pub struct ScheduledPublisher {
    connections: Arc<ConnectionManager>,
    clock: Arc<dyn Clock>,
}

impl ScheduledPublisher {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish everything due at the clock's current instant.
    ///
    /// Store errors are returned as-is; retrying is the caller's decision.
    #[instrument(skip(self), name = "scheduled_publication")]
    pub async fn publish_due(&self) -> Result<PublishReport, PublishError> {
        let store = self.connections.acquire().await?;
        let now = self.clock.now();

        let ids = blocking(store, move |store| store.publish_due(now))
            .await
            .map_err(PublishError::Update)?;

        if ids.is_empty() {
            debug!("no scheduled content due");
        } else {
            info!(count = ids.len(), ids = ?ids, "published scheduled content");
        }

        Ok(PublishReport {
            updated_count: ids.len(),
            ids,
            ran_at: now,
        })
    }

    /// Unpublished scheduled items and how many are due now. Changes nothing.
    pub async fn pending(&self) -> Result<PendingSummary, PublishError> {
        let store = self.connections.acquire().await?;
        let now = self.clock.now();

        let (due, items) = blocking(store, move |store| {
            Ok((store.count_due(now)?, store.list_pending()?))
        })
        .await
        .map_err(PublishError::Query)?;

        Ok(PendingSummary {
            due,
            items,
            checked_at: now,
        })
    }
}

#[async_trait]
impl Job for ScheduledPublisher {
    fn name(&self) -> &str {
        "scheduled-publication"
    }

    async fn run(&self) -> Result<PublishReport, PublishError> {
        self.publish_due().await
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(store: Arc<ContentStore>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&ContentStore) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

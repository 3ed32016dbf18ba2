//! `vitrine-publisher` — scheduled publication for vitrine content.
//!
//! # Overview
//!
//! Content items live in a SQLite `content_items` table. A draft item with a
//! `scheduled_at` in the past is *due*. [`job::ScheduledPublisher`] flips
//! every due item to published with one predicate-scoped update, so repeated
//! or overlapping runs are idempotent and never double-count.
//!
//! | Piece                              | Role                                        |
//! |------------------------------------|---------------------------------------------|
//! | [`connection::ConnectionManager`]  | One shared store handle per process         |
//! | [`job::ScheduledPublisher`]        | The publication run itself                  |
//! | [`trigger::Trigger`]               | Cadence driver with skip-if-running guard   |
//! | [`cadence::Cadence`]               | Cron / `@every` parsing                     |

pub mod cadence;
pub mod connection;
pub mod db;
pub mod error;
pub mod job;
pub mod store;
pub mod trigger;
pub mod types;

pub use cadence::Cadence;
pub use connection::{ConnectionManager, ConnectionState, Connector, SqliteConnector, StoreAddress};
pub use error::{ConnectionError, PublishError, StoreError};
pub use job::{Clock, Job, PendingSummary, PublishReport, ScheduledPublisher, SystemClock};
pub use store::ContentStore;
pub use trigger::{Trigger, TriggerSettings, TriggerSnapshot, TriggerStats};
pub use types::{ContentItem, NewContentItem};

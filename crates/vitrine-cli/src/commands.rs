//! Subcommand implementations. Each one is a thin wrapper over the
//! publisher crate; none adds behaviour of its own to a publication run.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};
use vitrine_core::{CoreError, VitrineConfig};
use vitrine_publisher::{
    ConnectionManager, Job, NewContentItem, PublishError, ScheduledPublisher, SqliteConnector,
    StoreError, Trigger, TriggerSettings,
};

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] CoreError),

    #[error("manual run rejected: missing or invalid token")]
    Unauthorized,

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn code(&self) -> &'static str {
        match self {
            CliError::Config(e) => e.code(),
            CliError::Unauthorized => "UNAUTHORIZED",
            CliError::Publish(e) => e.code(),
            CliError::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// 2 for problems fixed by changing invocation or config, 1 for run failures.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Config(_) | CliError::Unauthorized => ExitCode::from(2),
            CliError::Publish(_) | CliError::Other(_) => ExitCode::from(1),
        }
    }
}

/// One-shot publication run. Prints the report as JSON on stdout.
pub async fn publish(config: &VitrineConfig, token: Option<&str>) -> Result<(), CliError> {
    check_manual_token(config.publisher.manual_token.as_deref(), token)?;

    let publisher = ScheduledPublisher::new(ConnectionManager::global(&config.store));
    let report = publisher.run().await?;
    print_json(&report)
}

/// Run the trigger until Ctrl-C.
pub async fn watch(config: &VitrineConfig) -> Result<(), CliError> {
    let settings = TriggerSettings::from_config(config)?;
    info!(
        store = ?settings.store_address,
        cadence = %settings.cadence,
        "starting publication trigger"
    );

    let publisher = Arc::new(ScheduledPublisher::new(ConnectionManager::global(
        &config.store,
    )));
    let trigger = Trigger::new(publisher, settings.cadence);
    let stats = trigger.stats();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(trigger.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CliError::Other(e.into()))?;
    info!("interrupt received, stopping trigger");
    let _ = shutdown_tx.send(true);
    handle.await.map_err(|e| CliError::Other(e.into()))?;

    print_json(&stats.snapshot())
}

/// Create the schema regardless of `store.init_schema`.
pub async fn init_db(config: &VitrineConfig) -> Result<(), CliError> {
    let connector = SqliteConnector::new(&config.store).with_init_schema(true);
    ConnectionManager::new(Arc::new(connector))
        .acquire()
        .await
        .map_err(PublishError::from)?;
    info!("content schema ready");
    Ok(())
}

/// Scheduled drafts and the number currently due.
pub async fn pending(config: &VitrineConfig) -> Result<(), CliError> {
    let publisher = ScheduledPublisher::new(ConnectionManager::global(&config.store));
    let summary = publisher.pending().await?;
    print_json(&summary)
}

/// Insert a draft item, standing in for the content admin.
pub async fn schedule(
    config: &VitrineConfig,
    id: Option<String>,
    at: Option<DateTime<Utc>>,
) -> Result<(), CliError> {
    let store = ConnectionManager::global(&config.store)
        .acquire()
        .await
        .map_err(PublishError::from)?;
    let item = NewContentItem {
        id,
        scheduled_at: at,
    };
    let item = tokio::task::spawn_blocking(move || store.insert(item))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))
        .and_then(|inserted| inserted)
        .map_err(PublishError::Update)?;
    info!(item_id = %item.id, scheduled_at = ?item.scheduled_at, "draft item created");
    print_json(&item)
}

fn check_manual_token(expected: Option<&str>, supplied: Option<&str>) -> Result<(), CliError> {
    match (expected, supplied) {
        (None, _) => Ok(()),
        (Some(expected), Some(supplied)) if tokens_match(expected, supplied) => Ok(()),
        _ => Err(CliError::Unauthorized),
    }
}

fn tokens_match(expected: &str, supplied: &str) -> bool {
    let (expected, supplied) = (expected.as_bytes(), supplied.as_bytes());
    if expected.len() != supplied.len() {
        warn!("manual run token length mismatch");
        return false;
    }
    expected.ct_eq(supplied).into()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    let out = serde_json::to_string_pretty(value).map_err(|e| CliError::Other(e.into()))?;
    println!("{out}");
    Ok(())
}

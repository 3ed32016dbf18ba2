use std::process::ExitCode;

use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use tracing::error;
use vitrine_core::VitrineConfig;

mod commands;

use commands::CliError;

/// Ten years either side of now.
const MAX_OFFSET_SECS: i64 = 10 * 365 * 24 * 3600;

/// Scheduled publication engine for vitrine content.
#[derive(Debug, Parser)]
#[command(name = "vitrine", version)]
struct Cli {
    /// Config file (default: $VITRINE_CONFIG, then ./vitrine.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish every due item once and print the result as JSON.
    Publish {
        /// Required when `publisher.manual_token` is configured.
        #[arg(long, env = "VITRINE_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Run the publication trigger on its cadence until Ctrl-C.
    Watch,
    /// Create the content schema and exit.
    InitDb,
    /// List scheduled drafts and how many are due now.
    Pending,
    /// Insert a draft item, optionally scheduled for publication.
    Schedule {
        /// Item id (UUID v4 when omitted).
        #[arg(long)]
        id: Option<String>,
        /// Absolute RFC 3339 release time.
        #[arg(long, conflicts_with = "in_secs")]
        at: Option<DateTime<Utc>>,
        /// Release time relative to now, in seconds (negative = overdue).
        #[arg(
            long = "in",
            value_name = "SECS",
            allow_hyphen_values = true,
            value_parser = clap::value_parser!(i64).range(-MAX_OFFSET_SECS..=MAX_OFFSET_SECS)
        )]
        in_secs: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so `publish` output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitrine_cli=info,vitrine_publisher=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match VitrineConfig::load(cli.config.as_deref()) {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(CliError::from(e)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), error = %e, "command failed");
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}

async fn run(command: Command, config: VitrineConfig) -> Result<(), CliError> {
    match command {
        Command::Publish { token } => commands::publish(&config, token.as_deref()).await,
        Command::Watch => commands::watch(&config).await,
        Command::InitDb => commands::init_db(&config).await,
        Command::Pending => commands::pending(&config).await,
        Command::Schedule { id, at, in_secs } => {
            let at = at.or_else(|| in_secs.map(|secs| Utc::now() + Duration::seconds(secs)));
            commands::schedule(&config, id, at).await
        }
    }
}

use anyhow::{Context, Result};
use callsync_core::CheckInSource;
use callsync_storage::{HttpClientConfig, HttpFetcher};
use callsync_sync::{
    build_scheduler, engine_from_config, ingest_manual_checkin, open_store,
    run_sync_once_from_env, SyncConfig, SyncCoordinator,
};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "callsync")]
#[command(about = "Call-log check-in sync: fetch call transcripts, extract, persist")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync iteration and print the counts.
    Sync,
    /// Run the polling scheduler until Ctrl-C.
    Run,
    /// Run the scheduler and the read API.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Show call-log counts and recent sync runs.
    Status,
    #[command(subcommand)]
    User(UserCommands),
    /// Record an in-app check-in for a user.
    Checkin {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        text: String,
        /// Mark the check-in as transcribed voice input rather than typed text.
        #[arg(long)]
        voice: bool,
    },
}

#[derive(Debug, Subcommand)]
enum UserCommands {
    /// Register (or rename) the user who calls from a phone number.
    Add {
        #[arg(long)]
        phone: String,
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} resolved={} processed={} already_processed={} failed={}",
                report.run_id,
                report.fetched,
                report.resolved,
                report.processed,
                report.already_processed,
                report.failed
            );
        }
        Commands::Run => {
            let config = SyncConfig::from_env()?;
            let scheduler = build_scheduler(&config).await?;
            scheduler.start();
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "failed to listen for shutdown signal");
            }
            info!("shutdown requested; finishing in-flight records");
            scheduler.stop().await;
        }
        Commands::Serve => {
            callsync_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Status => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let (total, processed) = store.call_log_counts().await?;
            let last = store.last_successful_sync().await?;
            println!(
                "call logs: {total} total, {processed} processed, {} pending",
                total - processed
            );
            println!(
                "last successful sync: {}",
                last.map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            for run in store.recent_runs(5).await? {
                println!(
                    "  {} {:<9} {:<9} fetched={} processed={} failed={}{}",
                    run.started_at.to_rfc3339(),
                    run.trigger.as_str(),
                    run.status.as_str(),
                    run.fetched,
                    run.processed,
                    run.failed,
                    run.error.map(|e| format!(" error={e}")).unwrap_or_default()
                );
            }
        }
        Commands::User(UserCommands::Add { phone, name }) => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let user = store
                .register_user(&phone, &name)
                .await
                .with_context(|| format!("registering user {phone}"))?;
            println!("user {} registered: {} ({})", user.id, user.full_name, user.phone);
        }
        Commands::Checkin {
            user_id,
            text,
            voice,
        } => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: config.http_timeout(),
                ..Default::default()
            })?;
            let engine = engine_from_config(&config, http)?;
            let coordinator = SyncCoordinator::new(store, false);
            let source = if voice {
                CheckInSource::ManualVoice
            } else {
                CheckInSource::ManualText
            };
            let checkin =
                ingest_manual_checkin(&engine, &coordinator, user_id, source, &text).await?;
            println!(
                "check-in {} recorded for user {}: {}",
                checkin.id, user_id, checkin.summary
            );
        }
    }

    Ok(())
}

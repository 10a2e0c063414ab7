//! Dripline engine and REST API entry point.
//!
//! Binary name: `dripd`
//!
//! `dripd serve` connects to the database, starts the periodic execution
//! loop, and serves the admin REST API until interrupted.

mod http;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use http::router::build_router;
use state::{AppConfig, AppState};

#[derive(Parser)]
#[command(name = "dripd", about = "Dripline contact workflow engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and the admin API.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to bind the admin API on.
    #[arg(long, default_value = "127.0.0.1:8700")]
    listen: SocketAddr,

    /// SQLite database URL (defaults to ~/.dripline/dripline.db).
    #[arg(long, env = "DRIPLINE_DATABASE_URL")]
    database_url: Option<String>,

    /// Seconds between execution-loop ticks.
    #[arg(long, default_value_t = 60)]
    poll_interval_secs: u64,

    /// Max enrollments processed per tick.
    #[arg(long, default_value_t = 100)]
    batch_limit: u32,

    /// Base URL of the messaging provider API.
    #[arg(long, env = "DRIPLINE_MESSAGING_URL", default_value = "http://127.0.0.1:8800")]
    messaging_url: String,

    /// Bearer token for the messaging provider API.
    #[arg(long, env = "DRIPLINE_MESSAGING_TOKEN", default_value = "", hide_env_values = true)]
    messaging_token: String,

    /// Bridge tracing spans to an OpenTelemetry stdout exporter.
    #[arg(long)]
    otel: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    dripline_observe::tracing_setup::init_tracing(args.otel)
        .map_err(|e| anyhow::anyhow!("tracing init: {e}"))?;

    let config = AppConfig {
        database_url: args.database_url.clone(),
        poll_interval: Duration::from_secs(args.poll_interval_secs.max(1)),
        batch_limit: args.batch_limit,
        messaging_url: args.messaging_url.clone(),
        messaging_token: args.messaging_token.clone(),
    };
    let state = AppState::init(&config).await?;

    // Engine runner: a single periodic driver; shutdown lets the in-flight
    // tick finish.
    let cancel = CancellationToken::new();
    let runner = dripline_core::engine::runner::spawn(Arc::clone(&state.engine), cancel.clone());

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    tracing::info!(addr = %args.listen, "dripline admin API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    cancel.cancel();
    runner.await?;
    dripline_observe::tracing_setup::shutdown_tracing();
    Ok(())
}

use carecoord::api::{self, ApiState};
use carecoord::config::Config;
use carecoord::{daemon, db, engine};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "carecoord")]
#[command(about = "Observation analytics engine for care coordination")]
struct Cli {
    /// Path to carecoord.toml
    #[arg(long, global = true, env = "CARECOORD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true, env = "CARECOORD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Override the HTTP bind address
    #[arg(long, global = true, env = "CARECOORD_BIND")]
    bind: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and the background recompute loop (default)
    Serve,
    /// Drop and recompute all derived state for one subject, then exit
    Rebuild { subject_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    daemon::init_tracing(cli.debug, cli.json_logs);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(bind) = cli.bind {
        config.api.bind = bind;
    }

    let database_path = config.database_path();
    let pool = db::connect(&database_path)
        .await
        .with_context(|| format!("failed to open database at {}", database_path.display()))?;
    let engine = engine::Engine::new(pool, config.engine.clone());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(data_dir = %config.data_dir.display(), "starting carecoord");
            let recompute = engine::spawn_recompute_loop(Arc::clone(&engine));
            let state = Arc::new(ApiState::new(engine));
            api::serve(state, &config.api.bind, daemon::shutdown_signal()).await?;
            recompute.abort();
            tracing::info!("carecoord stopped");
        }
        Command::Rebuild { subject_id } => {
            engine.rebuild_subject(&subject_id).await?;
            let state = engine.snapshots().recompute_state(&subject_id).await?;
            tracing::info!(subject_id, last_computed_at = ?state.last_computed_at, "rebuild finished");
        }
    }

    Ok(())
}

//! cbridge - Calibre bridge CLI
//!
//! Drives the bridge directly from the command line: list libraries,
//! validate a config, or run a single action against a library.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use calibre_bridge::{
    CalibreWorkerSpawner, ConfigStore, Router, WorkerPoolManager, CONFIG_PATH_ENV, VERSION,
};

#[derive(Parser)]
#[command(name = "cbridge")]
#[command(version = VERSION)]
#[command(about = "Calibre library bridge", long_about = None)]
struct Cli {
    /// Config file. Falls back to $CALIBREMCP_CONFIGPATH, then ./config.json
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured libraries and their permissions
    Libraries,
    /// Load and validate the config file
    Check,
    /// Run one action against a library
    Call {
        /// Action name (e.g. search_books, get_book_details)
        action: String,
        /// Library name; omit to use the configured default
        #[arg(long)]
        library: Option<String>,
        /// Action parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    if let Some(path) = &cli.config {
        return path.clone();
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from("config.json")
}

fn init_logging(log_level: &str) {
    let level = match log_level {
        "error" => LevelFilter::ERROR,
        "warning" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        // "none" still surfaces unrecoverable problems
        _ => LevelFilter::OFF,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = config_path(&cli);

    let store = ConfigStore::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    let globals = store.globals();
    init_logging(&globals.log_level);

    match cli.command {
        Commands::Check => {
            println!(
                "config ok: {} libraries ({})",
                store.library_names().len(),
                store.library_names().join(", ")
            );
            Ok(())
        }
        Commands::Libraries => {
            println!("{}", serde_json::to_string_pretty(&store.list_libraries())?);
            Ok(())
        }
        Commands::Call {
            action,
            library,
            params,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("parsing --params as JSON")?;

            let log_dir = path
                .parent()
                .map(|p| p.join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs"));
            let spawner = Arc::new(CalibreWorkerSpawner::new(log_dir));
            let pool = WorkerPoolManager::new(spawner, globals);
            pool.start_sweep();

            let store = Arc::new(store);
            let router = Router::new(Arc::clone(&store), Arc::clone(&pool));

            let outcome = router.dispatch(&action, library.as_deref(), params).await;
            pool.shutdown().await;

            match outcome {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                    Ok(())
                }
                Err(e) => Err(anyhow!(e)),
            }
        }
    }
}

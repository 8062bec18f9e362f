//! Hoard CLI
//!
//! Inspect and edit the state a Hoard store persisted to disk.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hoard_store::{
    FileStore, KeyValueStore, NamedRegistry, PersistOptions, StoreConfig, CONFIG_FILE,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

mod db;

#[derive(Parser)]
#[command(name = "hoard")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and edit Hoard persisted state", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ./hoard.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the config
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stored value of a key
    Get {
        /// Registry key
        key: String,

        /// Treat the key as a full storage key (no prefix)
        #[arg(long)]
        raw: bool,
    },

    /// Store a JSON value under a key
    Set {
        /// Registry key
        key: String,

        /// Value as JSON
        value: String,
    },

    /// Delete a stored key
    Rm {
        /// Registry key
        key: String,

        /// Treat the key as a full storage key (no prefix)
        #[arg(long)]
        raw: bool,
    },

    /// List stored keys
    List {
        /// Print values next to keys
        #[arg(long)]
        values: bool,
    },

    /// Work with a pooled SQLite database
    Db {
        /// Database name
        #[arg(long)]
        db: Option<String>,

        /// Store (table) name
        #[arg(long)]
        store: Option<String>,

        #[command(subcommand)]
        command: db::DbCommands,
    },

    /// Show the resolved configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    hoard_store::logging::init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref(), cli.data_dir)?;
    let data_dir = config
        .data_dir
        .clone()
        .context("no data directory configured")?;
    debug!(data_dir = %data_dir.display(), "using data directory");

    match cli.command {
        Commands::Get { key, raw } => cmd_get(&config, &data_dir, &key, raw),

        Commands::Set { key, value } => cmd_set(config, &key, &value).await,

        Commands::Rm { key, raw } => cmd_rm(&config, &data_dir, &key, raw),

        Commands::List { values } => cmd_list(&data_dir, values),

        Commands::Db { db, store, command } => {
            let db = db.unwrap_or_else(|| config.db_name.clone());
            let store = store.unwrap_or_else(|| config.store_name.clone());
            db::run(&config, &data_dir, &db, &store, command).await
        }

        Commands::Info => cmd_info(&config),
    }
}

fn load_config(path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<StoreConfig> {
    let mut config = match path {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::load_from_dir(Path::new("."))?,
    };
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }
    if config.data_dir.is_none() {
        config.data_dir = Some(PathBuf::from(".hoard"));
    }
    Ok(config)
}

fn storage_key(config: &StoreConfig, key: &str, raw: bool) -> String {
    if raw {
        key.to_string()
    } else {
        config.storage_key(key)
    }
}

fn cmd_get(config: &StoreConfig, data_dir: &Path, key: &str, raw: bool) -> Result<()> {
    let store = FileStore::in_dir(data_dir);
    let storage_key = storage_key(config, key, raw);
    match store.get(&storage_key)? {
        Some(value) => println!("{value}"),
        None => anyhow::bail!("no value stored under '{}'", storage_key),
    }
    Ok(())
}

/// Goes through the registry so the write takes the same path an
/// application's would
async fn cmd_set(config: StoreConfig, key: &str, value: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(value).with_context(|| format!("'{value}' is not valid JSON"))?;

    let registry = NamedRegistry::builder()
        .config(config)
        .with_default_backends()?
        .build();
    let cell = registry.get_or_create(key, serde_json::Value::Null, Some(PersistOptions::json()))?;
    let previous = registry.hydrated(key).await;
    debug!(key, state = ?previous, "hydrated");

    cell.update(value)?;
    registry.shutdown().await?;
    info!("Stored {}", key);
    Ok(())
}

fn cmd_rm(config: &StoreConfig, data_dir: &Path, key: &str, raw: bool) -> Result<()> {
    let store = FileStore::in_dir(data_dir);
    let storage_key = storage_key(config, key, raw);
    if store.get(&storage_key)?.is_none() {
        anyhow::bail!("no value stored under '{}'", storage_key);
    }
    store.remove(&storage_key)?;
    info!("Removed {}", storage_key);
    Ok(())
}

fn cmd_list(data_dir: &Path, values: bool) -> Result<()> {
    let store = FileStore::in_dir(data_dir);
    for key in store.keys()? {
        if values {
            let value = store.get(&key)?.unwrap_or_default();
            println!("{key}\t{value}");
        } else {
            println!("{key}");
        }
    }
    Ok(())
}

fn cmd_info(config: &StoreConfig) -> Result<()> {
    println!("Hoard {}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", CONFIG_FILE);
    println!();
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_data_dir_override() {
        let config = load_config(None, Some(PathBuf::from("/tmp/hoard-data"))).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/hoard-data")));
        assert_eq!(storage_key(&config, "todos", false), "hoard:todos");
        assert_eq!(storage_key(&config, "todos", true), "todos");
    }
}

//! `hoard db` subcommands

use anyhow::{Context, Result};
use clap::Subcommand;
use hoard_store::{ConnectionPool, SqliteConnector, StoreConfig};
use std::path::Path;
use tracing::info;

#[derive(Subcommand)]
pub enum DbCommands {
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
    },

    /// List the keys of the store
    List,
}

pub async fn run(
    config: &StoreConfig,
    data_dir: &Path,
    db: &str,
    store: &str,
    command: DbCommands,
) -> Result<()> {
    let pool = ConnectionPool::new(SqliteConnector::new(data_dir));
    let connection = pool
        .acquire(db)
        .with_context(|| format!("failed to open database '{db}'"))?;

    match command {
        DbCommands::Get { key, raw } => {
            let key = if raw { key } else { config.storage_key(&key) };
            match connection.get(store, &key).await? {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("no value stored under '{}' in {}/{}", key, db, store),
            }
        }

        DbCommands::Set { key, value } => {
            serde_json::from_str::<serde_json::Value>(&value)
                .with_context(|| format!("'{value}' is not valid JSON"))?;
            let key = config.storage_key(&key);
            connection.put(store, &key, value).await?;
            info!("Stored {} in {}/{}", key, db, store);
        }

        DbCommands::Rm { key } => {
            let key = config.storage_key(&key);
            connection.delete(store, &key).await?;
            info!("Removed {} from {}/{}", key, db, store);
        }

        DbCommands::List => {
            for key in connection.keys(store).await? {
                println!("{key}");
            }
        }
    }

    connection.release();
    pool.close_all();
    Ok(())
}

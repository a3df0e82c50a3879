//! CLI entry point for lfs-gateway-admin: local credential management.

use clap::{Parser, Subcommand};
use lfs_gateway::config::{load_config, Config};
use lfs_gateway::metadata::sqlite::LocalMetaStore;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "lfs-gateway-admin",
    about = "Manage users of the local lfs-gateway metadata store"
)]
struct Cli {
    /// Gateway configuration; its `metadata.local.path` locates the store.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Store path, overriding the configuration.
    #[arg(long, global = true)]
    db: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a user or replace its secret
    AddUser { name: String, secret: String },
    /// Remove a user
    DelUser { name: String },
    /// List user names
    ListUsers,
}

fn resolve_db_path(config: Option<&PathBuf>, db: Option<String>) -> anyhow::Result<String> {
    if let Some(db) = db {
        return Ok(db);
    }
    let config = match config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    Ok(config.metadata.local.path)
}

fn main() {
    let cli = Cli::parse();
    let rc = match run(cli) {
        Ok(rc) => rc,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(rc);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let db_path = resolve_db_path(cli.config.as_ref(), cli.db)?;
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = LocalMetaStore::new(&db_path)?;

    match cli.command {
        Commands::AddUser { name, secret } => {
            if name.is_empty() || name.contains(':') || secret.is_empty() {
                eprintln!("Error: user names must be non-empty without ':' and secrets non-empty");
                return Ok(1);
            }
            store.add_user(&name, &secret)?;
            eprintln!("Added user {name}");
        }
        Commands::DelUser { name } => {
            if !store.delete_user(&name)? {
                eprintln!("Error: no such user: {name}");
                return Ok(1);
            }
            eprintln!("Deleted user {name}");
        }
        Commands::ListUsers => {
            for name in store.users()? {
                println!("{name}");
            }
        }
    }
    Ok(0)
}

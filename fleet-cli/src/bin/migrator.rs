//! Schema migration tool for the fleet database.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rusqlite::Connection;

use fleet_config::load_config;
use fleet_storage::migrations;

#[derive(Parser)]
#[command(author, version, about = "Fleet schema migrator")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "fleet.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply every pending migration
    Up,
    /// Revert the most recently applied migration
    Down,
    /// Show which migrations are applied
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)
        .with_context(|| format!("cannot read config at {}", cli.config.display()))?;
    let conn = Connection::open(&cfg.database_path)
        .with_context(|| format!("cannot open database at {}", cfg.database_path.display()))?;

    match cli.command {
        Command::Up => {
            let applied = migrations::up(&conn)?;
            if applied.is_empty() {
                println!("nothing to migrate");
            } else {
                for version in applied {
                    println!("applied migration {version}");
                }
            }
        }
        Command::Down => match migrations::down(&conn)? {
            Some(version) => println!("reverted migration {version}"),
            None => println!("no applied migrations"),
        },
        Command::Status => {
            for (version, name, applied) in migrations::status(&conn)? {
                let marker = if applied { "applied" } else { "pending" };
                println!("{version:>3}  {name:<24} {marker}");
            }
        }
    }
    Ok(())
}

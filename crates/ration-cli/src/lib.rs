//! Operator command surface for the record ration store.
//!
//! Host tooling can embed this surface through [`run_cli`] for full parsed
//! CLI execution, or call the `run_*` helpers directly against an open
//! [`RecordStore`] handle.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ration_core::{parse_day, IssuancePolicy, UserId};
use ration_store_sqlite::{InventoryReport, LedgerReport, RecordStore};

#[derive(Debug, Parser)]
#[command(name = "ration")]
#[command(about = "Record ration store CLI")]
pub struct Cli {
    #[arg(long, env = "RATION_DB")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Seed {
        #[command(subcommand)]
        command: Box<SeedCommand>,
    },
    Inventory(InventoryArgs),
    Ledger(LedgerArgs),
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum SeedCommand {
    Add(SeedAddArgs),
    File(SeedFileArgs),
}

#[derive(Debug, Args)]
pub struct SeedAddArgs {
    #[arg(long = "content")]
    contents: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SeedFileArgs {
    #[arg(long)]
    path: PathBuf,
}

#[derive(Debug, Args)]
pub struct InventoryArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LedgerArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    day: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct MigrateSummary {
    pub schema_version: Option<i64>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when opening or migrating the store fails, or when the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Db { command } => match *command {
            DbCommand::Migrate => {
                let store = RecordStore::open(&cli.db)?;
                store.migrate()?;
                let summary = MigrateSummary {
                    schema_version: store.schema_version()?,
                };
                println!("{}", serde_json::to_string_pretty(&summary)?);
                Ok(())
            }
        },
        Command::Seed { command } => {
            let mut store = open_migrated(&cli.db)?;
            run_seed(*command, &mut store)
        }
        Command::Inventory(args) => {
            let store = open_migrated(&cli.db)?;
            run_inventory(&args, &store)
        }
        Command::Ledger(args) => {
            let store = open_migrated(&cli.db)?;
            run_ledger(args, &store)
        }
    }
}

fn open_migrated(path: &std::path::Path) -> Result<RecordStore> {
    let store = RecordStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

/// Executes a parsed seed command against an existing store handle.
///
/// # Errors
/// Returns an error when the input is empty or a record fails validation.
pub fn run_seed(command: SeedCommand, store: &mut RecordStore) -> Result<()> {
    match command {
        SeedCommand::Add(args) => {
            if args.contents.is_empty() {
                return Err(anyhow!("at least one --content <text> is required"));
            }
            let report = store.seed_records(args.contents)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        SeedCommand::File(args) => {
            let raw = std::fs::read_to_string(&args.path)
                .with_context(|| format!("failed to read seed file {}", args.path.display()))?;
            let contents: Vec<&str> = raw
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect();
            if contents.is_empty() {
                return Err(anyhow!(
                    "seed file {} contains no records",
                    args.path.display()
                ));
            }
            let report = store.seed_records(contents)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Prints the per-category stock report.
///
/// # Errors
/// Returns an error when the inventory query fails.
pub fn run_inventory(args: &InventoryArgs, store: &RecordStore) -> Result<()> {
    let report = store.inventory(&IssuancePolicy::v1())?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_inventory(&report);
    }
    Ok(())
}

/// Prints one user's issuance ledger for a day.
///
/// # Errors
/// Returns an error when the user id or day key is malformed, or the ledger
/// query fails.
pub fn run_ledger(args: LedgerArgs, store: &RecordStore) -> Result<()> {
    let user = UserId::new(args.user).map_err(|err| anyhow!(err.to_string()))?;
    let day = parse_day(&args.day).map_err(|err| anyhow!(err.to_string()))?;
    let report = store.ledger(&user, day)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_ledger(&report);
    }
    Ok(())
}

fn print_inventory(report: &InventoryReport) {
    println!(
        "daily_quota={} live_categories={}",
        report.daily_quota,
        report.live_categories.join(",")
    );
    println!("{:<24} {:<8} unassigned", "category", "total");
    println!("{}", "-".repeat(48));
    for item in &report.categories {
        println!(
            "{:<24} {:<8} {}",
            item.category, item.total, item.unassigned
        );
    }
}

fn print_ledger(report: &LedgerReport) {
    println!(
        "user={} day={} issued={}",
        report.user_id, report.day, report.issued
    );
    for content in &report.contents {
        println!("{content}");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines, clippy::manual_let_else)]

    use super::*;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn temp_db_path(label: &str) -> (PathBuf, String) {
        let path =
            std::env::temp_dir().join(format!("ration-cli-{label}-{}.sqlite3", Ulid::new()));
        let raw = match path.to_str() {
            Some(value) => value.to_string(),
            None => panic!("temp db path must be valid UTF-8"),
        };
        (path, raw)
    }

    #[test]
    fn seed_add_requires_content() {
        let mut store = must(RecordStore::open(std::path::Path::new(":memory:")));
        must(store.migrate());
        let result = run_seed(SeedCommand::Add(SeedAddArgs { contents: vec![] }), &mut store);
        assert!(result.is_err());
    }

    #[test]
    fn ledger_rejects_malformed_days() {
        let store = must(RecordStore::open(std::path::Path::new(":memory:")));
        must(store.migrate());
        let result = run_ledger(
            LedgerArgs {
                user: "user-1".to_string(),
                day: "03/01/2026".to_string(),
                json: true,
            },
            &store,
        );
        assert!(result.is_err());
    }

    #[test]
    fn seed_file_skips_blank_and_comment_lines() {
        let (db_path, _) = temp_db_path("seed-file");
        let seed_path = std::env::temp_dir().join(format!("ration-seeds-{}.txt", Ulid::new()));
        if let Err(err) = std::fs::write(&seed_path, "# fixtures\nTRAIN-0001\n\n  BIKE-0001  \n") {
            panic!("failed to write seed file: {err}");
        }

        let mut store = must(RecordStore::open(&db_path));
        must(store.migrate());
        must(run_seed(
            SeedCommand::File(SeedFileArgs {
                path: seed_path.clone(),
            }),
            &mut store,
        ));

        let report = must(store.inventory(&IssuancePolicy::v1()));
        assert_eq!(report.categories.len(), 2);
        assert_eq!(report.daily_quota, 8);

        let _ = std::fs::remove_file(&seed_path);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn cli_end_to_end_migrate_seed_inventory_ledger() {
        let (db_path, db_path_str) = temp_db_path("e2e");

        must(execute_cli(vec![
            "ration".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "db".to_string(),
            "migrate".to_string(),
        ]));

        must(execute_cli(vec![
            "ration".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "seed".to_string(),
            "add".to_string(),
            "--content".to_string(),
            "TRAIN-0001".to_string(),
            "--content".to_string(),
            "BIKE-0001".to_string(),
        ]));

        must(execute_cli(vec![
            "ration".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "inventory".to_string(),
            "--json".to_string(),
        ]));

        must(execute_cli(vec![
            "ration".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "ledger".to_string(),
            "--user".to_string(),
            "user-1".to_string(),
            "--day".to_string(),
            "2026-03-01".to_string(),
            "--json".to_string(),
        ]));

        let _ = std::fs::remove_file(&db_path);
    }
}

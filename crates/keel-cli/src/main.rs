use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use keel_migrate::steps::builtin_registry;
use keel_migrate::{
    applied_history, audit, open_store, read_schema_version, MigrationConfig, MigrationRunner,
};
use rusqlite::Connection;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "keel")]
#[command(about = "Keel schema migration CLI")]
struct Cli {
    #[arg(long, default_value = "./keel.sqlite3")]
    db: PathBuf,

    /// YAML file with migration settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Audit,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Stop at this version instead of the latest one.
    #[arg(long)]
    to: Option<i64>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MigrationConfig> {
    match path {
        Some(path) => MigrationConfig::load(path)
            .with_context(|| format!("failed to load config file {}", path.display())),
        None => Ok(MigrationConfig::default()),
    }
}

/// Logs go to stderr so stdout stays a single JSON document. Returns false when a
/// global subscriber was already installed and this one was not.
fn init_tracing(fallback_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback_filter));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    if let Err(err) = installed {
        tracing::debug!(error = %err, "keeping the existing tracing subscriber");
        return false;
    }
    true
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.log_filter);

    let mut conn = open_store(&cli.db)
        .with_context(|| format!("failed to open store at {}", cli.db.display()))?;
    tracing::debug!(db = %cli.db.display(), "opened store");
    let runner = MigrationRunner::new(builtin_registry()?, config);

    match cli.command {
        Command::Db { command } => run_db(command, &runner, &mut conn),
    }
}

fn run_db(command: DbCommand, runner: &MigrationRunner, conn: &mut Connection) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(runner, conn),
        DbCommand::Migrate(args) => run_db_migrate(&args, runner, conn),
        DbCommand::Audit => run_db_audit(conn),
    }
}

fn run_db_schema_version(runner: &MigrationRunner, conn: &Connection) -> Result<()> {
    let status = runner.status(conn)?;
    let history = applied_history(conn)?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "history": history
    }))
}

fn run_db_migrate(
    args: &DbMigrateArgs,
    runner: &MigrationRunner,
    conn: &mut Connection,
) -> Result<()> {
    let before = runner.status(conn)?;
    let target = args.to.unwrap_or(before.target_version);

    if args.dry_run {
        let would_apply = runner.plan(before.current_version, target)?;
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": target,
            "would_apply_versions": would_apply
        }));
    }

    let summary = match runner.run(conn, before.current_version, target) {
        Ok(summary) => summary,
        Err(err) => {
            if let Some(report) = err.violations() {
                eprintln!("{}", report.render());
            }
            return Err(err).context("schema migration failed");
        }
    };

    let after_version = read_schema_version(conn)?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": summary.from_version,
        "applied_versions": summary.applied_versions,
        "after_version": after_version,
        "target_version": target,
        "skipped": summary.skipped,
        "up_to_date": after_version >= runner.registry().latest_version()
    }))
}

fn run_db_audit(conn: &Connection) -> Result<()> {
    let report = audit(conn)?;
    emit_json(serde_json::json!({
        "clean": report.is_empty(),
        "violation_count": report.len(),
        "violations": report.violations
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_tracing_init_keeps_the_first_subscriber() {
        init_tracing("warn");
        assert!(!init_tracing("debug"));
    }
}

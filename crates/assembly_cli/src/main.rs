//! Operational entry point for the assembly core.
//!
//! # Responsibility
//! - Run the one-shot reconciliation sweep (cron / ops).
//! - Print quorum and dashboard reports for one assembly.
//!
//! # Exit codes
//! - `0`: success, including a sweep that repaired everything it found.
//! - `1`: the sweep left at least one unit unrepaired.
//! - `2`: startup, configuration or store failure.

use assembly_core::service::report_service::ReportService;
use assembly_core::{
    init_logging, open_db, CoreConfig, QuorumService, ReconcileService, ServiceContext,
    SqliteStore, SweepReport,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "assembly", author, version, about, long_about = None)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, default_value = "assembly.db")]
    db: PathBuf,
    /// TOML configuration file; defaults apply when it does not exist
    #[arg(long, global = true, default_value = "assembly.toml")]
    config: PathBuf,
    /// Overrides `logging.level`
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Overrides `logging.dir` (absolute path)
    #[arg(long, global = true)]
    log_dir: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Repair broken proxies and orphaned rights transfers once
    Reconcile,
    /// Show the weighted quorum of an assembly
    Quorum {
        /// Assembly ID
        assembly: Uuid,
    },
    /// Print a report as JSON
    Report {
        #[arg(value_enum)]
        kind: ReportKind,
        /// Assembly ID
        assembly: Uuid,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportKind {
    Attendance,
    Absence,
    Votes,
    Proxies,
}

const EXIT_OK: u8 = 0;
const EXIT_PARTIAL: u8 = 1;
const EXIT_FAILURE: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(message) => {
            error!("event=cli_run module=cli status=error");
            eprintln!("error: {message}");
            EXIT_FAILURE
        }
    };
    ExitCode::from(code)
}

fn run(cli: Cli) -> Result<u8, String> {
    let (mut config, from_file) = load_config(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(dir) = cli.log_dir {
        config.logging.dir = Some(dir);
    }
    init_logging(&config.logging)?;
    info!(
        "event=cli_start module=cli status=ok config_from_file={} version={}",
        from_file,
        assembly_core::core_version()
    );

    let conn = open_db(&cli.db).map_err(|err| format!("failed to open database: {err}"))?;
    let store = SqliteStore::try_new(&conn).map_err(|err| err.to_string())?;
    let ctx = ServiceContext::new(config);

    match cli.command {
        Commands::Reconcile => {
            let report = ReconcileService::new(store, ctx)
                .sweep()
                .map_err(|err| err.to_string())?;
            for line in sweep_lines(&report) {
                println!("{line}");
            }
            return Ok(sweep_exit_code(&report));
        }
        Commands::Quorum { assembly } => {
            let snapshot = QuorumService::new(store, ctx)
                .compute(assembly)
                .map_err(|err| err.to_string())?;
            println!(
                "quorum {:.2}% ({} of {} units) threshold {:.2}% status {}",
                snapshot.percentage(),
                snapshot.present_units,
                snapshot.total_units,
                snapshot.threshold * 100.0,
                snapshot.status.label()
            );
        }
        Commands::Report { kind, assembly } => {
            let reports = ReportService::new(store);
            let json = match kind {
                ReportKind::Attendance => to_json(&reports.attendance(assembly)),
                ReportKind::Absence => to_json(&reports.absence(assembly)),
                ReportKind::Votes => to_json(&reports.votes(assembly)),
                ReportKind::Proxies => to_json(&reports.proxies(assembly)),
            }?;
            println!("{json}");
        }
    }
    Ok(EXIT_OK)
}

fn load_config(path: &Path) -> Result<(CoreConfig, bool), String> {
    if !path.exists() {
        return Ok((CoreConfig::default(), false));
    }
    CoreConfig::load(path)
        .map(|config| (config, true))
        .map_err(|err| err.to_string())
}

fn to_json<T: Serialize, E: std::fmt::Display>(report: &Result<T, E>) -> Result<String, String> {
    match report {
        Ok(value) => serde_json::to_string_pretty(value).map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    }
}

fn sweep_exit_code(report: &SweepReport) -> u8 {
    if report.has_failures() {
        EXIT_PARTIAL
    } else {
        EXIT_OK
    }
}

/// One line per repaired, skipped or failed unit and per deleted or retained
/// proxy.
fn sweep_lines(report: &SweepReport) -> Vec<String> {
    let mut lines = Vec::new();
    for repair in &report.repaired {
        lines.push(match repair.proxy {
            Some(proxy) => format!("repaired unit={} proxy={proxy}", repair.unit),
            None => format!("repaired unit={} orphaned", repair.unit),
        });
    }
    for unit in &report.skipped {
        lines.push(format!("skipped unit={unit} already with owner"));
    }
    for failure in &report.failed {
        lines.push(format!(
            "failed unit={} reason={}",
            failure.unit, failure.reason
        ));
    }
    for proxy in &report.deleted_proxies {
        lines.push(format!("deleted proxy={proxy}"));
    }
    for proxy in &report.retained_proxies {
        lines.push(format!("retained proxy={proxy}"));
    }
    if report.is_clean() {
        lines.push("nothing to repair".to_string());
    }
    lines
}

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ledger_sqlite::{Db, LegacyExport};
use port_inspect::Inspector;
use portledger_core::{AnnotationPatch, MergedPortItem, PlanOptions, PortKey, RiskLevel};
use socket_scan::ProcfsScanner;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;
#[cfg(feature = "http")]
mod gateway;
mod ledger;
mod logging;
mod scheduler;

use config::{Overrides, Settings};
use ledger::Ledger;
use scheduler::Scheduler;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "portledger", version, about = "Listening-port ledger: what the host shows, and what you know about it")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./portledger.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Host identifier recorded with every tuple
    #[arg(long, global = true)]
    host_id: Option<String>,
    /// Debug-level logging (RUST_LOG still wins)
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct TupleArgs {
    /// Port number (1-65535)
    port: i64,
    /// tcp or udp
    #[arg(long, default_value = "tcp")]
    protocol: String,
}

impl TupleArgs {
    fn key(&self, host_id: &str) -> Result<PortKey> {
        Ok(PortKey::parse(host_id, &self.protocol, self.port)?)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run the periodic scanner and the HTTP dashboard
    Serve {
        /// Listen address (default 127.0.0.1:2008)
        #[arg(long)]
        bind: Option<String>,
        /// Seconds between reconciliation cycles
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run one reconciliation cycle now
    Scan {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// List ports with notes and derived status
    Ports {
        /// Output format: text, json, or jsonl
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Output file (overwrites)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
        /// Write CSV instead of text/json when --out is provided
        #[arg(long, default_value_t = false)]
        csv: bool,
    },
    /// Timeline of one tuple, newest first
    History {
        #[command(flatten)]
        tuple: TupleArgs,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Create or update the note on a tuple. Only the given fields change.
    Note {
        #[command(flatten)]
        tuple: TupleArgs,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        owner: Option<String>,
        /// trusted, expected or suspicious
        #[arg(long, value_parser = parse_risk)]
        risk: Option<RiskLevel>,
        #[arg(long)]
        pinned: Option<bool>,
    },
    /// Delete the fact and the note of a tuple
    Forget {
        #[command(flatten)]
        tuple: TupleArgs,
    },
    /// Mark a tuple as seen by an operator
    Ack {
        #[command(flatten)]
        tuple: TupleArgs,
    },
    /// Run the inspection tool against a port
    Inspect {
        #[command(flatten)]
        tuple: TupleArgs,
        /// Append the output to the tuple's timeline
        #[arg(long, default_value_t = false)]
        record: bool,
    },
    /// Dump facts, notes and events as JSON
    Export {
        /// Output file (stdout if omitted)
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Load a JSON dump; tuples already present are skipped
    Import {
        file: PathBuf,
    },
}

fn parse_risk(s: &str) -> std::result::Result<RiskLevel, String> {
    s.parse::<RiskLevel>().map_err(|e| e.to_string())
}

fn write_out(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(path) => {
            let file = OpenOptions::new().create(true).truncate(true).write(true).open(path)?;
            let mut w = BufWriter::new(file);
            writeln!(w, "{}", text)?;
            w.flush()?;
        }
        None => println!("{}", text),
    }
    Ok(())
}

fn open_ledger(settings: &Settings) -> Result<Ledger> {
    let db = Db::open_or_create(&settings.database)?;
    Ok(Ledger::new(db, settings.host_id.clone()))
}

fn scheduler_for(settings: &Settings, ledger: Ledger) -> Scheduler {
    let scanner = Arc::new(ProcfsScanner::new(settings.proc_root.clone()));
    Scheduler::new(ledger, scanner, PlanOptions { heartbeat: settings.heartbeat })
}

fn inspector_for(settings: &Settings) -> Inspector {
    Inspector::new(settings.inspect_program.clone(), settings.inspect_args.clone(), settings.inspect_timeout)
}

fn opt(s: &Option<String>) -> &str {
    s.as_deref().unwrap_or("-")
}

fn port_line(p: &MergedPortItem) -> String {
    format!(
        "{:<4} {:>5}  {:<10} {:<11} pid={:<7} {:<16} {}{}",
        p.protocol.as_str(),
        p.port,
        p.derived_status.as_str(),
        p.current_state.map(|s| s.as_str()).unwrap_or("-"),
        p.current_pid.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        opt(&p.process_name),
        opt(&p.title),
        if p.uptime_human.is_empty() { String::new() } else { format!(" (up {})", p.uptime_human) },
    )
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let loaded_cfg = config::load_config(cli.config.as_deref())?;
    let (bind, interval_secs) = match &cli.command {
        Commands::Serve { bind, interval_secs } => (bind.clone(), *interval_secs),
        _ => (None, None),
    };
    let settings = Settings::resolve(
        loaded_cfg.as_ref(),
        Overrides { host_id: cli.host_id.clone(), database: cli.db.clone(), bind, interval_secs },
    )?;

    match cli.command {
        Commands::Version => {
            println!("portledger {} (core {})", env!("CARGO_PKG_VERSION"), portledger_core::version());
        }
        Commands::Serve { .. } => {
            let ledger = open_ledger(&settings)?;
            let scheduler = scheduler_for(&settings, ledger.clone());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async move {
                tracing::info!(
                    host_id = %settings.host_id,
                    db = %settings.database.display(),
                    interval_secs = settings.interval.as_secs(),
                    "starting reconciliation loop"
                );
                let periodic = scheduler.spawn_periodic(settings.interval);
                #[cfg(feature = "http")]
                let served = {
                    let state = gateway::AppState::new(ledger, scheduler, inspector_for(&settings), settings.frontend_dir.clone());
                    gateway::serve(state, settings.bind).await
                };
                #[cfg(not(feature = "http"))]
                let served = {
                    drop(ledger);
                    tokio::signal::ctrl_c().await.map_err(anyhow::Error::from)
                };
                periodic.abort();
                served
            })?;
        }
        Commands::Scan { format } => {
            let ledger = open_ledger(&settings)?;
            let scheduler = scheduler_for(&settings, ledger);
            let rt = tokio::runtime::Runtime::new()?;
            let report = rt.block_on(scheduler.run_cycle())?;
            let line = match format {
                OutputFormat::Text => format!(
                    "{}: {} listening, {} appeared, {} reappeared, {} process changes, {} disappeared",
                    report.host_id,
                    report.observed,
                    report.summary.appeared,
                    report.summary.reappeared,
                    report.summary.process_changed,
                    report.summary.disappeared
                ),
                OutputFormat::Json | OutputFormat::Jsonl => serde_json::to_string(&report)?,
            };
            println!("{}", line);
        }
        Commands::Ports { format, out, csv } => {
            let ledger = open_ledger(&settings)?;
            let rows = ledger.list_merged(&settings.host_id)?;
            if csv {
                if let Some(path) = &out {
                    let mut wtr = csv::Writer::from_writer(std::fs::File::create(path)?);
                    wtr.write_record(["host_id", "protocol", "port", "state", "derived_status", "pid", "process_name", "title", "owner", "risk_level", "uptime"])?;
                    for p in &rows {
                        wtr.write_record([
                            p.host_id.as_str(),
                            p.protocol.as_str(),
                            &p.port.to_string(),
                            p.current_state.map(|s| s.as_str()).unwrap_or(""),
                            p.derived_status.as_str(),
                            &p.current_pid.map(|v| v.to_string()).unwrap_or_default(),
                            p.process_name.as_deref().unwrap_or(""),
                            p.title.as_deref().unwrap_or(""),
                            p.owner.as_deref().unwrap_or(""),
                            &p.risk_level,
                            &p.uptime_human,
                        ])?;
                    }
                    wtr.flush()?;
                    return Ok(());
                } else {
                    println!("--csv requires --out <file>");
                }
            }
            let text = match format {
                OutputFormat::Text if rows.is_empty() => format!("{}: no ports recorded", settings.host_id),
                OutputFormat::Text => rows.iter().map(port_line).collect::<Vec<_>>().join("\n"),
                OutputFormat::Json => serde_json::to_string_pretty(&rows)?,
                OutputFormat::Jsonl => rows
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<std::result::Result<Vec<_>, _>>()?
                    .join("\n"),
            };
            write_out(out.as_deref(), &text)?;
        }
        Commands::History { tuple, limit, format } => {
            let ledger = open_ledger(&settings)?;
            let key = tuple.key(&settings.host_id)?;
            let events = ledger.timeline(&key, limit)?;
            match format {
                OutputFormat::Text => {
                    for e in &events {
                        let when = e.timestamp.format(&time::format_description::well_known::Rfc3339)?;
                        println!("{}  {:<15} pid={:<7} {}", when, e.kind.as_str(), e.pid, e.process_name);
                        if let Some(out) = &e.output {
                            for line in out.lines() {
                                println!("    {}", line);
                            }
                        }
                    }
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&events)?),
                OutputFormat::Jsonl => {
                    for e in &events {
                        println!("{}", serde_json::to_string(e)?);
                    }
                }
            }
        }
        Commands::Note { tuple, title, description, owner, risk, pinned } => {
            let ledger = open_ledger(&settings)?;
            let key = tuple.key(&settings.host_id)?;
            let patch = AnnotationPatch { title, description, owner, risk_level: risk, is_pinned: pinned };
            let note = ledger.upsert_annotation(&key, &patch)?;
            println!("{}", serde_json::to_string(&note)?);
        }
        Commands::Forget { tuple } => {
            let ledger = open_ledger(&settings)?;
            let key = tuple.key(&settings.host_id)?;
            let outcome = ledger.delete_tuple(&key)?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Ack { tuple } => {
            let ledger = open_ledger(&settings)?;
            let key = tuple.key(&settings.host_id)?;
            let event = ledger.acknowledge(&key)?;
            println!("{}", serde_json::to_string(&event)?);
        }
        Commands::Inspect { tuple, record } => {
            let key = tuple.key(&settings.host_id)?;
            let inspector = inspector_for(&settings);
            let rt = tokio::runtime::Runtime::new()?;
            let diagnosis = rt.block_on(inspector.inspect(key.protocol, key.port))?;
            println!("{}", diagnosis.output.trim_end());
            if record {
                let ledger = open_ledger(&settings)?;
                ledger.record_diagnosis(&key, &diagnosis.output)?;
                tracing::info!(%key, "diagnosis recorded");
            }
            if diagnosis.failed {
                return Err(anyhow!("inspection of {key} failed"));
            }
        }
        Commands::Export { out } => {
            let ledger = open_ledger(&settings)?;
            let dump = ledger.export_legacy()?;
            tracing::info!(runtimes = dump.runtimes.len(), notes = dump.notes.len(), events = dump.events.len(), "exported");
            write_out(out.as_deref(), &serde_json::to_string_pretty(&dump)?)?;
        }
        Commands::Import { file } => {
            let raw = std::fs::read_to_string(&file)?;
            let dump: LegacyExport = serde_json::from_str(&raw)
                .map_err(|e| anyhow!("{} is not a valid export: {e}", file.display()))?;
            let ledger = open_ledger(&settings)?;
            let report = ledger.import_legacy(&dump)?;
            println!("{}", serde_json::to_string(&report)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn note_flags_parse() {
        let cli = Cli::try_parse_from([
            "portledger", "--db", "/tmp/x.db", "note", "22", "--protocol", "tcp", "--risk", "trusted", "--pinned", "true",
        ])
        .unwrap();
        match cli.command {
            Commands::Note { tuple, risk, pinned, title, .. } => {
                assert_eq!(tuple.port, 22);
                assert_eq!(risk, Some(RiskLevel::Trusted));
                assert_eq!(pinned, Some(true));
                assert!(title.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn bad_risk_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["portledger", "note", "22", "--risk", "evil"]).is_err());
    }

    #[test]
    fn tuple_args_validate_port() {
        let t = TupleArgs { port: 0, protocol: "tcp".into() };
        assert!(t.key("local").is_err());
        let t = TupleArgs { port: 53, protocol: "udp".into() };
        assert_eq!(t.key("local").unwrap().to_string(), "local/udp/53");
    }
}

//! pingwell CLI: drive a file-backed telemetry client from the command line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use pingwell::storage;
use pingwell::{
    Configuration, Coordinator, FileEngine, InitContext, InitOutcome, MetricValue,
    PendingPingsScheduler, PingType, StaticClientInfo,
};

/// Pings every invocation registers before init.
const BUILTIN_PINGS: [(&str, bool); 3] = [("baseline", true), ("metrics", false), ("events", false)];

#[derive(Parser)]
#[command(
    name = "pingwell",
    about = "pingwell: telemetry client coordinator",
    version,
    author
)]
struct Cli {
    /// Application files directory; the engine keeps its data below it
    #[arg(long, global = true, default_value = "./pingwell")]
    dir: PathBuf,
    /// Application package name
    #[arg(long, global = true, default_value = "org.example.pingwell")]
    package: String,
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show client and engine state
    Status,
    /// Stage a metric value for the next ping of the given name
    Record {
        ping: String,
        key: String,
        value: String,
    },
    /// Send pings by name and enqueue the upload worker
    Send {
        #[arg(required = true)]
        pings: Vec<String>,
    },
    /// Manage experiment annotations
    Experiment {
        #[command(subcommand)]
        action: ExperimentAction,
    },
    /// List pings waiting for upload
    Pending {
        /// Print the body of one pending ping
        #[arg(long)]
        show: Option<String>,
    },
}

#[derive(Subcommand)]
enum ExperimentAction {
    /// Mark an experiment branch as active
    Set {
        id: String,
        branch: String,
        /// Extra metadata as key=value, repeatable
        #[arg(long = "extra", value_parser = parse_key_value)]
        extras: Vec<(String, String)>,
    },
    /// Mark an experiment as inactive
    Clear { id: String },
    /// List active experiments
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => Configuration::from_yaml_file(path)?,
        None => Configuration::default(),
    };
    let context = InitContext::new(&cli.dir, &cli.package);
    let data_dir = context.data_dir(&config);

    match cli.command {
        Commands::Status => cmd_status(&context, config)?,
        Commands::Record { ping, key, value } => {
            storage::stage_metric(&data_dir, &ping, &key, MetricValue::parse(&value))?;
            println!("Staged {}.{} = {}", ping, key, value);
        }
        Commands::Send { pings } => cmd_send(&context, config, pings)?,
        Commands::Experiment { action } => cmd_experiment(&context, config, action)?,
        Commands::Pending { show } => cmd_pending(&data_dir, show)?,
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
        return Ok(None);
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid log file: {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Build a coordinator, register the built-in pings and initialize it.
fn start(context: &InitContext, config: Configuration) -> Result<Coordinator> {
    let data_dir = context.data_dir(&config);
    let coordinator = Coordinator::new(
        Arc::new(FileEngine::new()),
        Arc::new(PendingPingsScheduler::new(&data_dir, config.server_endpoint.clone())),
        Arc::new(StaticClientInfo::new(env!("CARGO_PKG_VERSION")).with_display_version(env!("CARGO_PKG_VERSION"))),
    )?;
    for (name, send_if_empty) in BUILTIN_PINGS {
        coordinator.register_ping_type(&PingType::new(name, true, send_if_empty, vec![]));
    }

    match coordinator.initialize(context, config)? {
        InitOutcome::Initialized => Ok(coordinator),
        other => anyhow::bail!(
            "Could not initialize telemetry in {} ({:?})",
            data_dir.display(),
            other
        ),
    }
}

// ─── Command implementations ──────────────────────────────────────────────────

fn cmd_status(context: &InitContext, config: Configuration) -> Result<()> {
    let data_dir = context.data_dir(&config);
    let channel = config.channel.clone().unwrap_or_else(|| "-".to_string());
    let coordinator = start(context, config)?;
    let pending = storage::list_pending_pings(&data_dir)?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Field", "Value"]);
    table.add_row(["Initialized", &coordinator.is_initialized().to_string()]);
    table.add_row(["Application id", &context.application_id()]);
    table.add_row(["Data dir", &data_dir.display().to_string()]);
    table.add_row(["Channel", &channel]);
    table.add_row(["Upload enabled", &coordinator.get_upload_enabled().to_string()]);
    table.add_row(["Pending pings", &pending.len().to_string()]);
    println!("{}", table);

    coordinator.shutdown()?;
    Ok(())
}

fn cmd_send(context: &InitContext, config: Configuration, pings: Vec<String>) -> Result<()> {
    let data_dir = context.data_dir(&config);
    let coordinator = start(context, config)?;
    for name in &pings {
        if !BUILTIN_PINGS.iter().any(|(builtin, _)| builtin == name) {
            coordinator.register_ping_type(&PingType::new(name.as_str(), true, false, vec![]));
        }
    }

    let before = storage::list_pending_pings(&data_dir)?.len();
    match coordinator.send_pings_by_name(pings) {
        Some(completion) => completion.wait()?,
        None => anyhow::bail!("Pings were not sent (is upload disabled?)"),
    }
    let after = storage::list_pending_pings(&data_dir)?.len();

    if after > before {
        println!("✓ Queued {} ping(s) for upload", after - before);
    } else {
        println!("No pings had content, nothing queued");
    }
    coordinator.shutdown()?;
    Ok(())
}

fn cmd_experiment(context: &InitContext, config: Configuration, action: ExperimentAction) -> Result<()> {
    let data_dir = context.data_dir(&config);
    let coordinator = start(context, config)?;

    match action {
        ExperimentAction::Set { id, branch, extras } => {
            let extra = (!extras.is_empty()).then(|| extras.into_iter().collect::<HashMap<_, _>>());
            coordinator.set_experiment_active(id.as_str(), branch.as_str(), extra);
            coordinator.shutdown()?;
            println!("✓ Experiment '{}' active on branch '{}'", id, branch);
        }
        ExperimentAction::Clear { id } => {
            coordinator.set_experiment_inactive(id.as_str());
            coordinator.shutdown()?;
            println!("✓ Experiment '{}' inactive", id);
        }
        ExperimentAction::List => {
            coordinator.shutdown()?;
            let experiments = storage::load_experiments(&data_dir)?;
            if experiments.is_empty() {
                println!("No active experiments");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(["Experiment", "Branch", "Extra"]);
            for (id, record) in &experiments {
                let extra = record
                    .extra
                    .as_ref()
                    .map(|e| {
                        let mut pairs: Vec<_> = e.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                        pairs.sort();
                        pairs.join(", ")
                    })
                    .unwrap_or_else(|| "-".to_string());
                table.add_row([id.as_str(), record.branch.as_str(), &extra]);
            }
            println!("{}", table);
        }
    }
    Ok(())
}

fn cmd_pending(data_dir: &Path, show: Option<String>) -> Result<()> {
    if let Some(document_id) = show {
        let ping = storage::read_pending_ping(data_dir, &document_id)?;
        println!("{}", ping.path);
        println!("{}", serde_json::to_string_pretty(&ping.body)?);
        return Ok(());
    }

    let pending = storage::list_pending_pings(data_dir)?;
    if pending.is_empty() {
        println!("No pending pings in '{}'", data_dir.display());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(["Document", "Ping", "Size"]);
    for p in &pending {
        table.add_row([p.document_id.as_str(), p.ping_name.as_str(), &format_size(p.size)]);
    }
    println!("Pending pings in: {}", data_dir.display());
    println!("{}", table);
    Ok(())
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

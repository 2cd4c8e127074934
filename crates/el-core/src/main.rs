//! Event Logger - fault-triggered evidence collection
//!
//! The command-line entry point:
//! - `collect`: run the collection rule for one event and print the report
//! - `peers`: resolve the IPC peer chain of a process
//! - `config`: print the effective configuration

use clap::{Args, Parser, Subcommand};
use el_common::{Event, ProcessId};
use el_core::catcher::{resolve_peers, PeerLayer};
use el_core::config::{load_config, ConfigOptions, ResolvedConfig, Rule};
use el_core::exit_codes::ExitCode;
use el_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use el_core::wait_graph::format_paths;
use el_core::EventLogger;
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use tracing::debug;

/// Event Logger - collect forensic evidence when a fault event fires
#[derive(Parser)]
#[command(name = "event-logger")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file (takes precedence over EL_CONFIG and the XDG location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format on stderr (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collect evidence for one event and print the collection report
    Collect(CollectArgs),

    /// Resolve the IPC peer chain of a process
    Peers(PeersArgs),

    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct CollectArgs {
    /// Event name, e.g. THREAD_BLOCK_6S
    #[arg(long, required_unless_present = "event_file")]
    event: Option<String>,

    /// Subject pid
    #[arg(long)]
    pid: Option<u32>,

    #[arg(long)]
    uid: Option<u32>,

    #[arg(long)]
    tid: Option<u32>,

    /// Subject process name, used when the pid is stale
    #[arg(long)]
    process_name: Option<String>,

    /// Free-text message recorded in the artifact summary
    #[arg(long)]
    msg: Option<String>,

    /// Catcher command overriding the configured rule, e.g. "c,m,s,pb:2"
    #[arg(long)]
    command: Option<String>,

    /// Throttle interval in seconds overriding the configured rule
    #[arg(long)]
    interval: Option<u64>,

    /// Read the event as JSON from a file, or from stdin with "-"
    #[arg(long, value_name = "PATH|-")]
    event_file: Option<String>,
}

#[derive(Args, Debug)]
struct PeersArgs {
    /// Root pid
    #[arg(long)]
    pid: u32,

    /// Root thread the hop walk starts from (0: any thread)
    #[arg(long, default_value_t = 0)]
    tid: u32,

    /// Layer: 1 strongest, -1 all, -2 head/tail, N>=2 hops
    #[arg(long, default_value = "1", allow_hyphen_values = true)]
    layer: i32,

    /// Transaction log to read instead of the configured location
    #[arg(long)]
    log: Option<PathBuf>,
}

#[derive(Serialize)]
struct NotCollected<'a> {
    event: &'a str,
    pid: u32,
    collected: bool,
}

#[derive(Serialize)]
struct PeersOutput {
    pid: u32,
    layer: String,
    log: PathBuf,
    peers: Vec<u32>,
    paths: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(cli.global.log_level, cli.global.log_format);
    init_logging(&log_config);

    let resolved = match load_config(&ConfigOptions {
        config_path: cli.global.config.clone(),
    }) {
        Ok(resolved) => resolved,
        Err(e) => {
            let err = el_common::Error::from(e);
            eprintln!("event-logger: {}", err);
            std::process::exit(ExitCode::from(&err).as_i32());
        }
    };
    debug!(path = ?resolved.path, "configuration loaded");

    let exit_code = match cli.command {
        Commands::Collect(args) => run_collect(resolved, &args),
        Commands::Peers(args) => run_peers(&resolved, &args),
        Commands::Config => run_config(&resolved),
    };
    std::process::exit(exit_code.as_i32());
}

fn run_collect(resolved: ResolvedConfig, args: &CollectArgs) -> ExitCode {
    let mut event = match build_event(args) {
        Ok(event) => event,
        Err(message) => {
            eprintln!("event-logger: {}", message);
            return ExitCode::ArgsError;
        }
    };

    let rule = match resolved.config.rule_for(&event.name) {
        Some(rule) => Some(Rule {
            event: rule.event.clone(),
            command: args.command.clone().unwrap_or_else(|| rule.command.clone()),
            interval_secs: args.interval.unwrap_or(rule.interval_secs),
        }),
        None => args.command.clone().map(|command| Rule {
            event: event.name.clone(),
            command,
            interval_secs: args.interval.unwrap_or(0),
        }),
    };

    let logger = EventLogger::from_config(resolved.config);
    let outcome = match &rule {
        Some(rule) => logger.handle_rule(&mut event, rule),
        None => logger.handle(&mut event),
    };

    match outcome {
        Ok(Some(report)) => {
            print_json(&report);
            ExitCode::for_task(report.state)
        }
        Ok(None) => {
            print_json(&NotCollected {
                event: &event.name,
                pid: event.subject_pid().0,
                collected: false,
            });
            ExitCode::NotCollected
        }
        Err(e) => {
            eprintln!("event-logger: collection failed: {}", e);
            ExitCode::from(&e)
        }
    }
}

/// Event from `--event-file` and/or flags; flags win.
fn build_event(args: &CollectArgs) -> Result<Event, String> {
    let mut event = match args.event_file.as_deref() {
        Some(source) => {
            let text = if source == "-" {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .map_err(|e| format!("cannot read event from stdin: {}", e))?;
                text
            } else {
                std::fs::read_to_string(source)
                    .map_err(|e| format!("cannot read event file {}: {}", source, e))?
            };
            serde_json::from_str::<Event>(&text).map_err(|e| format!("invalid event JSON: {}", e))?
        }
        None => Event::new(String::new(), ProcessId(0)),
    };

    if let Some(name) = &args.event {
        event.name = name.clone();
    }
    if event.name.trim().is_empty() {
        return Err("event name is required".to_string());
    }
    if let Some(pid) = args.pid {
        event.pid = ProcessId(pid);
    }
    if let Some(uid) = args.uid {
        event.uid = uid;
    }
    if let Some(tid) = args.tid {
        event.tid = tid;
    }
    if let Some(name) = &args.process_name {
        event.set_value(el_common::payload_keys::PROCESS_NAME, name.clone());
    }
    if let Some(msg) = &args.msg {
        event.set_value(el_common::payload_keys::MSG, msg.clone());
    }
    Ok(event)
}

fn run_peers(resolved: &ResolvedConfig, args: &PeersArgs) -> ExitCode {
    let Some(layer) = PeerLayer::from_param(args.layer) else {
        eprintln!(
            "event-logger: invalid layer {} (use 1, -1, -2 or a hop count >= 2)",
            args.layer
        );
        return ExitCode::ArgsError;
    };

    let mut paths = resolved.config.paths.clone();
    if let Some(log) = &args.log {
        paths.ipc_transaction_log = log.to_string_lossy().into_owned();
    }

    let resolution = resolve_peers(&paths, args.pid, args.tid, layer);
    let rendered = format_paths(&resolution.paths);
    print_json(&PeersOutput {
        pid: args.pid,
        layer: layer.to_string(),
        log: paths.ipc_log_for(args.pid),
        peers: resolution.peers(args.pid),
        paths: rendered.lines().map(str::to_string).collect(),
    });
    ExitCode::Clean
}

fn run_config(resolved: &ResolvedConfig) -> ExitCode {
    #[derive(Serialize)]
    struct ConfigOutput<'a> {
        path: Option<&'a PathBuf>,
        config: &'a el_core::config::Config,
    }
    print_json(&ConfigOutput {
        path: resolved.path.as_ref(),
        config: &resolved.config,
    });
    ExitCode::Clean
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("event-logger: cannot render output: {}", e),
    }
}

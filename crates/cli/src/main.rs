mod config;
mod serve;
mod sms;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use fieldops_engine::{PolicyEntry, PolicyTable};

use crate::config::ServeConfig;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Field-service ticket lifecycle engine.
#[derive(Parser)]
#[command(name = "fieldops", version, about = "Field-service ticket lifecycle engine")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the lifecycle HTTP API server
    Serve {
        /// Path to a TOML server configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on (overrides the configuration file)
        #[arg(long)]
        port: Option<u16>,
        /// Path to TLS certificate PEM file (requires --tls-key)
        #[arg(long)]
        tls_cert: Option<PathBuf>,
        /// Path to TLS private key PEM file (requires --tls-cert)
        #[arg(long)]
        tls_key: Option<PathBuf>,
    },

    /// Print the transition policy table
    Policy {
        /// Policy file to print instead of the built-in table
        #[arg(long)]
        policy_file: Option<PathBuf>,
    },

    /// Validate a policy table and report unreachable states and dead ends
    Check {
        /// Policy file to check (default: the built-in table)
        policy_file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            tls_cert,
            tls_key,
        } => {
            if tls_cert.is_some() != tls_key.is_some() {
                eprintln!("error: --tls-cert and --tls-key must both be provided");
                process::exit(1);
            }
            let mut config = match ServeConfig::load(config.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(1);
                }
            };
            if let Some(port) = port {
                config.port = port;
            }
            init_tracing(&config.log_level);

            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("error: failed to create tokio runtime: {}", e);
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config, tls_cert, tls_key)) {
                eprintln!("Server error: {}", e);
                process::exit(1);
            }
        }
        Commands::Policy { policy_file } => {
            cmd_policy(policy_file.as_deref(), cli.output, cli.quiet);
        }
        Commands::Check { policy_file } => {
            cmd_check(policy_file.as_deref(), cli.output, cli.quiet);
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_policy(path: Option<&Path>, output: OutputFormat, quiet: bool) -> PolicyTable {
    match path {
        None => PolicyTable::standard(),
        Some(path) => match PolicyTable::load(path) {
            Ok(table) => table,
            Err(e) => {
                report_error(&format!("error: {}", e), output, quiet);
                process::exit(1);
            }
        },
    }
}

fn cmd_policy(path: Option<&Path>, output: OutputFormat, quiet: bool) {
    let table = load_policy(path, output, quiet);
    if quiet {
        return;
    }
    match output {
        OutputFormat::Json => {
            let edges: Vec<&PolicyEntry> = table.entries().collect();
            let json = serde_json::to_string_pretty(&serde_json::json!({ "edges": edges }))
                .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
            println!("{}", json);
        }
        OutputFormat::Text => {
            for entry in table.entries() {
                println!("{}", describe_edge(entry));
            }
        }
    }
}

fn describe_edge(entry: &PolicyEntry) -> String {
    let roles = if entry.allowed_roles.is_empty() {
        "any".to_string()
    } else {
        entry
            .allowed_roles
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut requires = Vec::new();
    if entry.requires_photos() {
        requires.push(format!("{} photo(s)", entry.min_photos));
    }
    if entry.requires_notes {
        requires.push("notes".to_string());
    }
    if entry.requires_technician {
        requires.push("technician".to_string());
    }
    if entry.requires_customer_confirmation {
        requires.push("customer confirmation".to_string());
    }

    let mut line = format!("{} -> {}  [{}]", entry.from, entry.to, roles);
    if !requires.is_empty() {
        line.push_str(&format!("  requires: {}", requires.join(", ")));
    }
    if let Some(field) = entry.notes_field {
        line.push_str(&format!("  notes -> {}", field.as_str()));
    }
    line
}

fn cmd_check(path: Option<&Path>, output: OutputFormat, quiet: bool) {
    let table = load_policy(path, output, quiet);
    let analysis = table.analyze();

    if !quiet {
        match output {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(&analysis)
                    .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
                println!("{}", json);
            }
            OutputFormat::Text => {
                let names = |states: &[fieldops_engine::TicketState]| {
                    if states.is_empty() {
                        "(none)".to_string()
                    } else {
                        states.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    }
                };
                println!("edges: {}", analysis.edge_count);
                println!("reachable states: {}", analysis.reachable.len());
                println!("unreachable: {}", names(&analysis.unreachable));
                println!("dead ends: {}", names(&analysis.dead_ends));
                if analysis.is_clean() {
                    println!("policy is clean");
                }
            }
        }
    }

    if !analysis.is_clean() {
        process::exit(1);
    }
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_api::{InProcApi, ProjectSettingsApi};
use keel_apply::Outcome;
use keel_core::{KeelError, RemoteState, Version};
use keel_remote::{FileRemote, RemoteConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel CLI: project settings reconciliation")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path of the file-backed remote (default: ~/.keel/project.json)
    #[arg(long = "remote", global = true, env = "KEEL_REMOTE_PATH")]
    remote: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the remote record at version 1
    Init {
        #[arg(long = "key")]
        key: String,
        #[arg(long = "name")]
        name: String,
        /// Repeatable, e.g. --currency EUR --currency USD
        #[arg(long = "currency")]
        currencies: Vec<String>,
        #[arg(long = "country")]
        countries: Vec<String>,
        #[arg(long = "language")]
        languages: Vec<String>,
    },
    /// Print the current remote settings as a config document
    Show,
    /// Show the update batch a config file would submit
    Plan {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Reconcile the remote onto a config file
    Apply {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Fail with a conflict unless the remote is still at this version
        #[arg(long = "baseline-version")]
        baseline_version: Option<Version>,
    },
    /// Print the declared config schema
    Schema,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_config(path: &Path) -> Result<keel_core::DesiredState> {
    let doc = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let desired = keel_schema::decode_yaml(&doc).with_context(|| format!("decoding {}", path.display()))?;
    Ok(desired)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.remote.clone().map(RemoteConfig::new).unwrap_or_else(RemoteConfig::from_env);

    match run(cli, &cfg).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => {
            eprintln!("project settings not provisioned at {} (run `keelctl init` first)", cfg.path.display());
            std::process::exit(2);
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            Err(e)
        }
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.chain().any(|c| matches!(c.downcast_ref::<KeelError>(), Some(KeelError::NotFound)))
}

async fn run(cli: Cli, cfg: &RemoteConfig) -> Result<()> {
    let t0 = Instant::now();
    match cli.command {
        Commands::Init { key, name, currencies, countries, languages } => {
            info!(key = %key, path = %cfg.path.display(), "init invoked");
            let mut state = RemoteState::new(key, name);
            state.currencies = currencies;
            state.countries = countries;
            state.languages = languages;
            FileRemote::new(cfg.path.clone()).seed(&state)?;
            match cli.output {
                Output::Human => println!("seeded {} at {} (version {})", state.key, cfg.path.display(), state.version),
                Output::Json => println!("{}", serde_json::to_string_pretty(&state)?),
            }
        }
        Commands::Show => {
            info!("show invoked");
            let api = InProcApi::from_config(cfg);
            let tracked = api.read().await?.ok_or(KeelError::NotFound)?;
            match cli.output {
                Output::Human => {
                    println!("# {} @ version {}", tracked.id, tracked.version);
                    print!("{}", serde_yaml::to_string(&keel_schema::encode_value(&tracked.view))?);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&tracked)?),
            }
        }
        Commands::Plan { file } => {
            info!(file = %file.display(), "plan invoked");
            let desired = read_config(&file)?;
            let api = InProcApi::from_config(cfg);
            let plan = api.plan(&desired).await?.ok_or(KeelError::NotFound)?;
            match cli.output {
                Output::Human => match &plan.request {
                    None => println!("no changes (version {})", plan.remote.version),
                    Some(req) => {
                        println!("ACTION                        PAYLOAD  (expected version {})", req.expected_version);
                        for a in &req.actions {
                            println!("{:<29} {}", a.name(), serde_json::to_string(a)?);
                        }
                    }
                },
                Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
            }
        }
        Commands::Apply { file, baseline_version } => {
            info!(file = %file.display(), baseline = ?baseline_version, "apply invoked");
            let desired = read_config(&file)?;
            let api = InProcApi::from_config(cfg);
            let report = match api.reconciler().reconcile(&desired, baseline_version).await? {
                Outcome::Settled(report) => report,
                Outcome::NotFound => return Err(KeelError::NotFound.into()),
            };
            match cli.output {
                Output::Human => {
                    if report.applied {
                        println!(
                            "applied {} action(s): version {} -> {}",
                            report.actions.len(),
                            report.previous_version,
                            report.state.version
                        );
                    } else {
                        println!("already in sync (version {})", report.state.version);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
        Commands::Schema => {
            let schema = keel_schema::resource_schema();
            match cli.output {
                Output::Human => {
                    println!("{}", schema.resource);
                    for f in &schema.fields {
                        println!("  {:<42} {:<12} {:<17} {}", f.path, format!("{:?}", f.kind), format!("{:?}", f.presence), f.description);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&schema)?),
            }
        }
    }
    info!(took_ms = %t0.elapsed().as_millis(), "done");
    Ok(())
}

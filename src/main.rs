use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskdispatch::api::state::AppState;
use taskdispatch::config::{DispatchConfig, LoggingConfig};
use taskdispatch::dispatch::RunRequest;
use taskdispatch::model::{Outcome, TestSuite, TestSuitePatch};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "taskdispatch",
    about = "Priority task dispatch and script packaging for remote test endpoints",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML); falls back to $TASKDISPATCH_CONFIG, then /etc/taskdispatch/taskdispatch.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (HTTP API)
    Serve {
        /// Bind address, overrides server.listen_address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Create the priority queues for an endpoint
    Provision {
        /// Endpoint address, e.g. 10.0.0.5:8270
        #[arg(long)]
        endpoint: String,
    },

    /// Submit a run of a test suite against an endpoint
    Submit {
        #[arg(long)]
        suite: String,

        #[arg(long)]
        endpoint: String,

        /// 1 (most urgent) to 3
        #[arg(long)]
        priority: Option<u8>,
    },

    /// Claim the next task for an endpoint
    Claim {
        #[arg(long)]
        endpoint: String,
    },

    /// Report a running task as finished
    Complete {
        #[arg(long)]
        task: Uuid,

        #[arg(long, value_parser = parse_outcome)]
        outcome: Outcome,
    },

    /// Package a script and its dependencies into an archive
    Pack {
        /// Script name, with or without extension
        #[arg(long)]
        script: String,

        /// Output file; defaults to <script>.<archive extension> in the current directory
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Manage test suites
    Suites {
        #[command(subcommand)]
        action: SuiteAction,
    },

    /// Inspect endpoint queues
    Queues {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum SuiteAction {
    /// List all suites
    List,

    /// Register a new suite
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        path: Option<String>,

        #[arg(long)]
        author: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued tasks per endpoint and priority
    List,
}

fn parse_outcome(s: &str) -> std::result::Result<Outcome, String> {
    match s {
        "completed" => Ok(Outcome::Completed),
        "failed" => Ok(Outcome::Failed),
        other => Err(format!("expected 'completed' or 'failed', got '{other}'")),
    }
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load configuration with a stderr logger in place, since the real one is
/// configured by the file being loaded.
fn load_config(explicit: Option<&Path>) -> Result<DispatchConfig> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || DispatchConfig::load_or_default(explicit))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.server.listen_address = bind.clone();
    }
    init_tracing(&config.logging);
    let open = || AppState::from_config(&config);

    match cli.command {
        Commands::Serve { .. } => {
            tracing::info!(bind = %config.server.listen_address, "Starting taskdispatch daemon");
            taskdispatch::serve(config.clone()).await?;
        }
        Commands::Provision { endpoint } => {
            let queue = open()?.dispatcher.provision(&endpoint).await?;
            println!("Provisioned queues for {}.", queue.endpoint_address);
        }
        Commands::Submit {
            suite,
            endpoint,
            priority,
        } => {
            let req = RunRequest {
                priority,
                ..RunRequest::new(endpoint)
            };
            let id = open()?.dispatcher.submit_run(&suite, req).await?;
            println!("{id}");
        }
        Commands::Claim { endpoint } => match open()?.dispatcher.claim(&endpoint).await? {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => println!("No task available for {endpoint}."),
        },
        Commands::Complete { task, outcome } => {
            let task = open()?.dispatcher.complete(task, outcome).await?;
            println!("Task {} is {}.", task.id, task.status);
        }
        Commands::Pack { script, out } => {
            let artifact = open()?.packager.pack(&script).await?;
            let dest = out.unwrap_or_else(|| PathBuf::from(artifact.file_name()));
            artifact
                .persist(&dest)
                .with_context(|| format!("writing {}", dest.display()))?;
            println!("{} ({} bytes)", dest.display(), artifact.size());
        }
        Commands::Suites { action } => match action {
            SuiteAction::List => {
                let suites = open()?.dispatcher.list_suites().await?;
                if suites.is_empty() {
                    println!("No test suites found.");
                }
                for name in suites {
                    println!("{name}");
                }
            }
            SuiteAction::Add { name, path, author } => {
                let mut suite = TestSuite::new(&name)?;
                TestSuitePatch {
                    path,
                    author,
                    ..Default::default()
                }
                .apply(&mut suite)?;
                let suite = open()?.dispatcher.register_suite(suite).await?;
                println!("Test suite '{}' added.", suite.test_suite);
            }
        },
        Commands::Queues { action } => match action {
            QueueAction::List => {
                let queues = open()?.dispatcher.list_queues().await?;
                if queues.is_empty() {
                    println!("No endpoints provisioned.");
                } else {
                    println!("{:<24} | {:<8} | Tasks", "Endpoint", "Priority");
                    println!("{:-<24}-|-{:-<8}-|-{:-<36}", "", "", "");
                    for q in queues {
                        for lane in q.lanes {
                            println!(
                                "{:<24} | {:<8} | {}",
                                q.endpoint_address,
                                lane.priority.level(),
                                lane.tasks.len()
                            );
                        }
                    }
                }
            }
        },
    }

    Ok(())
}

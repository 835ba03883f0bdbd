mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ralph_core::agent::AgentRegistry;
use ralph_core::config::CoordinatorConfig;
use ralph_core::coordinator::Coordinator;
use ralph_core::tracker::{MemoryTracker, Tracker};

#[derive(Parser)]
#[command(
    name = "ralph",
    about = "Repository-native coordinator for parallel coding-agent workflows"
)]
struct Cli {
    /// Repository root (defaults to the current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator over a task list until quiescent
    Run {
        /// TOML task list to seed the tracker with
        #[arg(long)]
        tasks: PathBuf,
        /// Config file (defaults to <repo>/ralph.toml)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured worker count
        #[arg(long)]
        max_workers: Option<usize>,
        /// Print every event as a JSON line
        #[arg(long)]
        print_events: bool,
    },
    /// Parse and validate the configuration, then exit
    ValidateConfig {
        /// Config file (defaults to <repo>/ralph.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let repo_root = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    match cli.command {
        Commands::ValidateConfig { config } => {
            let config = load_config(&repo_root, config)?;
            println!(
                "configuration ok: {} workers, integration branch {}",
                config.max_workers,
                config.integration_branch()
            );
            Ok(())
        }
        Commands::Run {
            tasks,
            config,
            max_workers,
            print_events,
        } => {
            let mut config = load_config(&repo_root, config)?;
            if let Some(n) = max_workers {
                config.max_workers = n;
                config.validate()?;
            }

            let task_list = tasks::load_tasks(&tasks)?;
            println!("loaded {} tasks from {}", task_list.len(), tasks.display());
            let tracker = Arc::new(MemoryTracker::with_tasks(task_list));

            let registry = AgentRegistry::with_builtins();
            let coordinator = Arc::new(
                Coordinator::new(
                    config,
                    &repo_root,
                    Arc::clone(&tracker) as Arc<dyn Tracker>,
                    &registry,
                )
                .await?,
            );

            if print_events {
                let _sub = coordinator.events().on(|event| {
                    println!("{}", event.to_log_json());
                });
            }

            // Ctrl-C stops dispatch; in-flight agent runs finish.
            {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("stop requested; letting in-flight work finish");
                        coordinator.stop();
                    }
                });
            }

            let summary = coordinator.run().await?;
            println!(
                "run finished: {} completed, {} blocked ({} event kinds)",
                summary.completed_tasks,
                summary.blocked_tasks,
                summary.event_counts.len()
            );
            if summary.blocked_tasks > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn load_config(repo_root: &std::path::Path, explicit: Option<PathBuf>) -> Result<CoordinatorConfig> {
    match explicit {
        Some(path) => CoordinatorConfig::load_from(&path),
        None => CoordinatorConfig::load(repo_root),
    }
}

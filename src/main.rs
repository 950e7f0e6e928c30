use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use canopy::client::{ApiClient, StreamClient};
use canopy::config::Config;
use canopy::core::{TaskId, TreeId, TreeSelector};
use canopy::orchestration::{AgentDispatcher, CommandDispatcher, EchoDispatcher};
use canopy::server::{self, ServeSettings};
use canopy::{Error, Result};

/// Canopy - tree-structured task orchestration runtime
#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CANOPY_DEBUG=1  Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.canopy/canopy.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Server to talk to (defaults to the configured bind address)
    #[arg(long, global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the orchestration server
    Serve {
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,

        /// Initial maximum number of RUNNING tasks
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Start with step mode enabled for every tree
        #[arg(long)]
        step_mode: bool,

        /// Complete every task with its own instruction instead of running an agent
        #[arg(long)]
        echo: bool,
    },

    /// Submit an instruction as a new task tree
    Submit {
        instruction: String,

        /// Stream the tree's events after submitting
        #[arg(long, short = 'w')]
        watch: bool,
    },

    /// List all task trees
    Trees,

    /// Show every task of one tree
    Tree { tree_id: String },

    /// Stream events of one tree, or of all trees
    Watch { tree_id: Option<String> },

    /// Release a task paused by step mode
    Continue { task_id: u64 },

    /// Flag a task for human review
    Flag {
        task_id: u64,
        reason: String,

        /// Also flag every unresolved descendant
        #[arg(long)]
        subtree: bool,
    },

    /// Show or change the live runtime config
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the server's system state
    State,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the current config and its version
    Show,

    /// Replace fields of the current config
    Set {
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Global step mode on or off
        #[arg(long)]
        step_mode: Option<bool>,

        /// Enable step mode for a tree ("*" for all); repeatable
        #[arg(long = "step-tree")]
        step_trees: Vec<String>,

        /// Drop every per-tree step mode entry first
        #[arg(long)]
        clear_step_trees: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    canopy::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    if let Command::Serve {
        bind,
        port,
        max_parallel,
        step_mode,
        echo,
    } = cli.command
    {
        return rt.block_on(run_serve(config, bind, port, max_parallel, step_mode, echo));
    }

    let base_url = cli
        .server
        .clone()
        .unwrap_or_else(|| config.server.base_url());
    let api = ApiClient::new(&base_url);
    rt.block_on(run_client(api, cli.command))
}

async fn run_serve(
    mut config: Config,
    bind: Option<String>,
    port: Option<u16>,
    max_parallel: Option<usize>,
    step_mode: bool,
    echo: bool,
) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(max_parallel) = max_parallel {
        config.runtime.max_parallel_tasks = max_parallel;
    }
    if step_mode {
        config.runtime.step_mode = true;
    }
    config.runtime.validate()?;

    let dispatcher: Option<Arc<dyn AgentDispatcher>> = if echo {
        Some(Arc::new(EchoDispatcher))
    } else if let Some(command) = &config.agent.command {
        Some(Arc::new(
            CommandDispatcher::from_command_line(command)?
                .with_timeout(config.agent.timeout())
                .with_default_agent(&config.agent.default_agent),
        ))
    } else {
        None
    };

    let addr: SocketAddr = config.server.address().parse().map_err(|e| {
        Error::Validation(format!("invalid address {}: {}", config.server.address(), e))
    })?;
    info!(%addr, echo, "canopy starting");

    server::serve(ServeSettings {
        addr,
        data_dir: config.data_dir()?,
        runtime: config.runtime.clone(),
        dispatcher,
        child_failure_policy: config.child_failure_policy,
    })
    .await
}

fn parse_tree_id(raw: &str) -> Result<TreeId> {
    raw.parse()
        .map_err(|e| Error::Validation(format!("invalid tree id {:?}: {}", raw, e)))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_client(api: ApiClient, command: Command) -> Result<()> {
    match command {
        Command::Serve { .. } => Ok(()),
        Command::Submit { instruction, watch } => {
            let submission = api.submit(&instruction).await?;
            print_json(&submission)?;
            if watch {
                watch_events(api, Some(submission.tree_id)).await?;
            }
            Ok(())
        }
        Command::Trees => {
            let trees = api.trees().await?;
            if trees.all_trees.is_empty() {
                println!("No task trees.");
                return Ok(());
            }
            println!(
                "{:<10} {:<14} {:>6}  {:<8} {}",
                "TREE", "STATUS", "TASKS", "RUNNING", "ROOT"
            );
            for tree in trees.all_trees {
                println!(
                    "{:<10} {:<14} {:>6}  {:<8} {}",
                    tree.tree_id.short(),
                    tree.status.to_string(),
                    tree.task_count,
                    if tree.has_running_tasks { "yes" } else { "no" },
                    truncate(&tree.root_task.instruction, 60),
                );
            }
            Ok(())
        }
        Command::Tree { tree_id } => {
            let tasks = api.tree(parse_tree_id(&tree_id)?).await?;
            for task in tasks {
                let parent = task
                    .parent_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>4} {:>6} {:<17} {}",
                    task.id.to_string(),
                    parent,
                    task.status.to_string(),
                    truncate(&task.instruction, 60),
                );
            }
            Ok(())
        }
        Command::Watch { tree_id } => {
            let tree_id = tree_id.as_deref().map(parse_tree_id).transpose()?;
            watch_events(api, tree_id).await
        }
        Command::Continue { task_id } => print_json(&api.continue_task(TaskId(task_id)).await?),
        Command::Flag {
            task_id,
            reason,
            subtree,
        } => print_json(&api.flag(TaskId(task_id), &reason, subtree).await?),
        Command::Config { action } => match action {
            ConfigAction::Show => print_json(&api.config().await?),
            ConfigAction::Set {
                max_parallel,
                step_mode,
                step_trees,
                clear_step_trees,
            } => {
                let mut config = api.config().await?.config;
                if let Some(max_parallel) = max_parallel {
                    config.max_parallel_tasks = max_parallel;
                }
                if let Some(step_mode) = step_mode {
                    config.step_mode = step_mode;
                }
                if clear_step_trees {
                    config.step_mode_threads.clear();
                }
                for raw in step_trees {
                    let selector = TreeSelector::try_from(raw).map_err(Error::Validation)?;
                    if !config.step_mode_threads.contains(&selector) {
                        config.step_mode_threads.push(selector);
                    }
                }
                print_json(&api.set_config(&config).await?)
            }
        },
        Command::State => {
            println!("{}", api.system_state().await?);
            Ok(())
        }
    }
}

/// Print events as JSON lines until ctrl-c.
async fn watch_events(api: ApiClient, tree_id: Option<TreeId>) -> Result<()> {
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.cancel();
        }
    });

    let mut client = StreamClient::new(api, tree_id);
    client
        .run(cancel, |event| match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("failed to encode event: {}", e),
        })
        .await
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", cut)
}

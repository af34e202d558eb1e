use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indexmap::IndexMap;

use sidekick::client::ApiClient;
use sidekick::config::SidekickConfig;
use sidekick::flow::FlowEngine;
use sidekick::model::{FlowType, UserResponse};
use sidekick::orchestrator::Orchestrator;
use sidekick::server;
use sidekick::store::Database;

#[derive(Parser)]
#[command(name = "side", version, about = "Sidekick agent runtime")]
struct Cli {
    /// Server address (for `serve`, the bind address; for client
    /// commands, the server to talk to).
    #[arg(long, global = true, default_value = "127.0.0.1:8855")]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sidekick server.
    Serve,
    /// Register a workspace for a local repository.
    NewWorkspace {
        name: String,
        /// Path to the repository.
        local_repo_dir: String,
    },
    /// List registered workspaces.
    Workspaces,
    /// Create a task and start its flow.
    NewTask {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, value_enum, default_value = "basic-dev")]
        flow_type: CliFlowType,
        /// Flow options as JSON (e.g. '{"targetBranch":"main"}').
        #[arg(long, default_value = "{}")]
        flow_options: String,
    },
    /// Show a task and its flows.
    Task {
        #[arg(long)]
        workspace: String,
        id: String,
    },
    /// Cancel a task and its flows.
    CancelTask {
        #[arg(long)]
        workspace: String,
        id: String,
    },
    /// List a flow's actions.
    Actions {
        #[arg(long)]
        workspace: String,
        flow: String,
        #[arg(long)]
        after: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Complete a pending human action.
    Respond {
        #[arg(long)]
        workspace: String,
        action: String,
        #[arg(long)]
        approve: bool,
        #[arg(long, default_value = "")]
        content: String,
    },
    /// Send a free-form user action to a flow.
    UserAction {
        #[arg(long)]
        workspace: String,
        flow: String,
        action_type: String,
    },
    /// Query a flow's state.
    Query {
        #[arg(long)]
        workspace: String,
        flow: String,
        #[arg(default_value = "status")]
        query: String,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliFlowType {
    BasicDev,
    PlannedDev,
}

impl From<CliFlowType> for FlowType {
    fn from(value: CliFlowType) -> Self {
        match value {
            CliFlowType::BasicDev => FlowType::BasicDev,
            CliFlowType::PlannedDev => FlowType::PlannedDev,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = SidekickConfig::from_env()?;
    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .init();

    let client = ApiClient::new(format!("http://{}", cli.addr));
    match cli.command {
        Command::Serve => serve(config, cli.addr).await,
        Command::NewWorkspace {
            name,
            local_repo_dir,
        } => {
            let workspace = client.create_workspace(&name, &local_repo_dir).await?;
            println!("{}", serde_json::to_string_pretty(&workspace)?);
            Ok(())
        }
        Command::Workspaces => {
            for workspace in client.list_workspaces().await? {
                println!("{}\t{}\t{}", workspace.id, workspace.name, workspace.local_repo_dir);
            }
            Ok(())
        }
        Command::NewTask {
            workspace,
            title,
            description,
            flow_type,
            flow_options,
        } => {
            let flow_options: IndexMap<String, serde_json::Value> =
                serde_json::from_str(&flow_options).context("parsing --flow-options")?;
            let task = client
                .create_task(&workspace, &title, &description, flow_type.into(), flow_options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&task.task)?);
            for flow in &task.flows {
                println!("flow: {} ({})", flow.id, flow.status);
            }
            Ok(())
        }
        Command::Task { workspace, id } => {
            let task = client.get_task(&workspace, &id).await?;
            println!("{}", serde_json::to_string_pretty(&task.task)?);
            for flow in &task.flows {
                println!("flow: {} ({})", flow.id, flow.status);
            }
            Ok(())
        }
        Command::CancelTask { workspace, id } => {
            let task = client.cancel_task(&workspace, &id).await?;
            println!("task {} is {}", task.id, task.status);
            Ok(())
        }
        Command::Actions {
            workspace,
            flow,
            after,
            limit,
        } => {
            let actions = client
                .list_flow_actions(&workspace, &flow, after.as_deref(), limit)
                .await?;
            for action in actions {
                println!(
                    "{}\t{}\t{}{}",
                    action.id,
                    action.action_type,
                    action.action_status,
                    if action.is_human_action { "\t[human]" } else { "" }
                );
            }
            Ok(())
        }
        Command::Respond {
            workspace,
            action,
            approve,
            content,
        } => {
            let response = UserResponse {
                content,
                approved: Some(approve),
                choice: None,
                params: None,
            };
            let action = client
                .complete_flow_action(&workspace, &action, &response)
                .await?;
            println!("action {} is {}", action.id, action.action_status);
            Ok(())
        }
        Command::UserAction {
            workspace,
            flow,
            action_type,
        } => {
            let action = client.send_user_action(&workspace, &flow, &action_type).await?;
            println!("recorded {}", action.id);
            Ok(())
        }
        Command::Query {
            workspace,
            flow,
            query,
        } => {
            let result = client.query_flow(&workspace, &flow, &query, None).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

async fn serve(config: SidekickConfig, addr: SocketAddr) -> anyhow::Result<()> {
    log::info!(
        "sidekick {} starting, data home {}",
        env!("CARGO_PKG_VERSION"),
        config.data_home.display()
    );
    std::fs::create_dir_all(config.worktrees_dir())
        .with_context(|| format!("creating {}", config.worktrees_dir().display()))?;

    let db = Database::in_memory();
    let engine = FlowEngine::new(db.clone());
    let resumed = engine.recover().context("recovering flows")?;
    if resumed > 0 {
        log::info!("resumed {resumed} in-flight flows");
    }

    let orchestrator = Arc::new(Orchestrator::new(db, engine));
    let app = server::router(orchestrator);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    log::info!("listening on http://{addr}");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

//! FlowGraph agent daemon.

use anyhow::Context;
use clap::Parser;
use flowgraph_cluster::{Agent, AgentConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowgraph-agent")]
#[command(about = "FlowGraph per-host agent", long_about = None)]
#[command(version)]
struct Cli {
    /// Master endpoint to register with
    #[arg(short, long, env = "FLOWGRAPH_MASTER_ENDPOINT", default_value = "127.0.0.1:6499")]
    master: String,

    /// Externally reachable address of this host
    #[arg(long, env = "FLOWGRAPH_THIS_HOST")]
    host: Option<String>,

    /// Root directory for per-task control groups; omit to disable
    #[arg(long, env = "FLOWGRAPH_CGROUP_ROOT")]
    cgroup_root: Option<PathBuf>,

    /// Log filter, e.g. "info" or "flowgraph_cluster=debug"
    #[arg(long, default_value = "info", env = "FLOWGRAPH_LOG")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    let config = AgentConfig {
        master_endpoint: cli.master.clone(),
        cgroup_root: cli.cgroup_root,
        host: cli.host,
        ..AgentConfig::default()
    };

    let agent = Agent::new(config)
        .with_context(|| format!("failed to register with master at {}", cli.master))?;
    tracing::info!(frontier = agent.endpoint(), "agent ready");

    agent.run().context("agent loop failed")?;
    Ok(())
}

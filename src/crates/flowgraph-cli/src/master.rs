//! FlowGraph master daemon.

use anyhow::Context;
use clap::Parser;
use flowgraph_cluster::Master;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flowgraph-master")]
#[command(about = "FlowGraph cluster coordinator", long_about = None)]
#[command(version)]
struct Cli {
    /// Address to listen on for agents and graph clients
    #[arg(short, long, default_value = "0.0.0.0:6499")]
    listen: String,

    /// Log filter, e.g. "info" or "flowgraph_cluster=debug"
    #[arg(long, default_value = "info", env = "FLOWGRAPH_LOG")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();

    let master = Master::new(&cli.listen)
        .with_context(|| format!("failed to start master on {}", cli.listen))?;
    tracing::info!(endpoint = master.endpoint(), "master ready");

    master.run().context("master loop failed")?;
    Ok(())
}

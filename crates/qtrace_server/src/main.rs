use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use qtrace_server::node::{run_node, NodeArgs};

#[derive(Parser, Debug)]
#[command(name = "qtrace-server")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an instrumented node with the synthetic workload.
    Node(NodeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => run_node(args).await,
    }
}

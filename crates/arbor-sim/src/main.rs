mod common;
mod events;
mod output;
mod protocols;
mod run;
mod status;

use arbor_overlay::HostConfig;
use arbor_transport::TransportConfig;
use clap::{Parser, Subcommand};
use protocols::Demo;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "arbor-sim", about = "Run Arbor protocols over local hosts")]
struct Cli {
    /// Max message size in bytes.
    #[arg(long, default_value = "16777216")]
    max_message_size: usize,

    /// Also append JSONL events to a file in this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a tree over local hosts and run rounds of a demo protocol.
    Run {
        #[arg(long, value_enum, default_value = "count")]
        protocol: Demo,
        /// Number of hosts (listening on 127.0.0.1).
        #[arg(long, default_value = "5")]
        hosts: usize,
        /// Tree positions; hosts are reused when larger than --hosts.
        #[arg(long)]
        nodes: Option<usize>,
        /// Branching factor.
        #[arg(long, default_value = "2")]
        bf: usize,
        /// Number of rounds.
        #[arg(long, default_value = "1")]
        rounds: u32,
        /// Per-round timeout in seconds.
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// Delay between rounds in ms.
        #[arg(long, default_value = "0")]
        delay: u64,
        /// Seconds parked data waits for its tree.
        #[arg(long)]
        pending_timeout: Option<u64>,
    },

    /// Start hosts and query their status service as a client.
    Status {
        #[arg(long, default_value = "3")]
        hosts: usize,
        /// Client timeout in seconds.
        #[arg(long, default_value = "5")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let transport = TransportConfig::new().max_message_size(cli.max_message_size);

    eprintln!("arbor-sim v{}", env!("CARGO_PKG_VERSION"));

    let mode = match &cli.command {
        Command::Run { protocol, .. } => protocol.name(),
        Command::Status { .. } => "status",
    };
    if let Some(dir) = &cli.output_dir {
        let path = output::resolve_jsonl_path(dir, mode)?;
        output::init_jsonl_writer(&path)?;
        eprintln!("JSONL: {}", path.display());
    }
    eprintln!();

    match cli.command {
        Command::Run {
            protocol,
            hosts,
            nodes,
            bf,
            rounds,
            timeout,
            delay,
            pending_timeout,
        } => {
            anyhow::ensure!(hosts > 0, "--hosts must be at least 1");
            let mut host_config = HostConfig::new().transport(transport);
            if let Some(secs) = pending_timeout {
                host_config = host_config.pending_timeout(Duration::from_secs(secs));
            }

            run::run(
                run::RunConfig {
                    demo: protocol,
                    hosts,
                    nodes: nodes.unwrap_or(hosts),
                    bf,
                    rounds,
                    timeout: Duration::from_secs(timeout),
                    delay_ms: delay,
                },
                host_config,
                start,
            )
            .await?;
        }

        Command::Status { hosts, timeout } => {
            status::run(hosts, transport, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}

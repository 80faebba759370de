use clap::Parser;
use tierflow::{
    Node, ShutdownMode, TopologyEvent,
    config::{NodeConfig, read_config_file},
    control::ControlCommand,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,

    /// Log level of the node
    #[arg(long, default_value = "trace")]
    log_level: LevelFilter,
}

fn init(level: LevelFilter) {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![("tierflow", level), ("tierflow_node", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

/// Announce grouping changes on stdout for the control plane
async fn announce_grouping_changes(mut events: broadcast::Receiver<TopologyEvent>) {
    loop {
        match events.recv().await {
            Ok(TopologyEvent::ActiveGroupingChanged {
                current, aggregator, ..
            }) => {
                println!("-NOTIFY-GROUPING-CHANGE: {current}");
                if aggregator {
                    println!("-NOTIFY-AGGREGATOR: {current}");
                }
            }
            Ok(TopologyEvent::Cleared) => println!("-NOTIFY-GROUPING-CHANGE: NONE"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("announcer lagged, skipped {skipped} topology events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    let config = match &args.file {
        Some(file) => read_config_file(file)?,
        None => NodeConfig::default(),
    };
    let node = Node::start(&config)?;
    tokio::spawn(announce_grouping_changes(node.topology().subscribe()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ControlCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("ERROR {e}");
                continue;
            }
        };
        if command == ControlCommand::Exit {
            break;
        }

        match node.execute(command).await {
            Ok(response) => println!("{response}"),
            Err(e) => {
                error!("control command failed: {e:#}");
                println!("ERROR {e:#}");
            }
        }
    }

    let remaining = node.shutdown(ShutdownMode::Drain).await?;
    debug!("exiting: remaining_tasks={remaining}");
    Ok(())
}

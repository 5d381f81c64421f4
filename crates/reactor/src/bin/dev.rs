use clap::Parser;
use reactor::{
    Config, ExecutorConfig, NoopReducer, Reactor, RemoteFilter, ServerConfig, StorageConfig,
    SyncConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run multiple reactor nodes locally for development", long_about = None)]
struct Args {
    /// Number of nodes to start
    #[arg(short, long, default_value = "2")]
    nodes: u16,

    /// Data directory root (each node gets a subdirectory)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

struct NodeSetup {
    config: Config,
    _temp_dir: Option<TempDir>, // Keep alive to prevent cleanup
}

fn generate_node_configs(num_nodes: u16, data_dir: Option<PathBuf>) -> Vec<NodeSetup> {
    let mut setups = Vec::new();

    for node in 1..=num_nodes {
        let (db_path, temp_dir) = if let Some(ref base_dir) = data_dir {
            let node_dir = base_dir.join(format!("{}", node));
            (node_dir.join("node.db"), None)
        } else {
            let temp_dir = TempDir::new().expect("Failed to create temp directory");
            let path = temp_dir.path().join("node.db");
            (path, Some(temp_dir))
        };

        let config = Config {
            server: ServerConfig {
                node_name: format!("node-{}", node),
                sync_addr: format!("127.0.0.1:{}", 7700 + node - 1),
                db_path,
            },
            executor: ExecutorConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
        };

        setups.push(NodeSetup {
            config,
            _temp_dir: temp_dir,
        });
    }

    setups
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if args.nodes == 0 {
        eprintln!("Error: Number of nodes must be at least 1");
        std::process::exit(1);
    }

    info!("Starting {}-node local mesh...", args.nodes);

    if let Some(ref data_dir) = args.data_dir {
        for node in 1..=args.nodes {
            std::fs::create_dir_all(data_dir.join(format!("{}", node)))?;
        }
    }

    let setups = generate_node_configs(args.nodes, args.data_dir);
    for setup in &setups {
        info!(
            "Node '{}': sync={}, db={:?}",
            setup.config.server.node_name,
            setup.config.server.sync_addr,
            setup.config.server.db_path
        );
    }

    // Start every node
    let mut reactors = Vec::new();
    for setup in &setups {
        let reactor = Reactor::new(setup.config.clone(), Arc::new(NoopReducer))?;
        reactor.start().await?;
        reactors.push(reactor);
    }

    // Connect every node to every other node
    for (i, reactor) in reactors.iter().enumerate() {
        for (j, setup) in setups.iter().enumerate() {
            if i == j {
                continue;
            }
            if let Err(e) = reactor
                .add_remote(
                    &setup.config.server.node_name,
                    &setup.config.server.sync_addr,
                    RemoteFilter::default(),
                )
                .await
            {
                error!(
                    "Failed to connect '{}' to '{}': {}",
                    reactors[i].node_name(),
                    setup.config.server.node_name,
                    e
                );
            }
        }
    }

    // Keep setups alive so temp directories survive
    let _keep_alive = setups;

    info!("All nodes started and meshed. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Received Ctrl+C, shutting down...");
    for reactor in &reactors {
        reactor.stop(true).await;
    }
    info!("Shutdown complete");
    Ok(())
}

use std::sync::Arc;
use pointsync::engine::{Durable, MemoryDurable, Persistence, Store, StoreConfig};
use pointsync::hub::{Hub, HubConfig};
use pointsync::server::Router;
use pointsync::{SyncApi, USERS};
use clap::Parser;
use std::env;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    data_dir: Option<String>,

    #[arg(short, long)]
    port: Option<String>,

    /// Connections beyond this are rejected.
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    #[arg(long)]
    cache_max_keys: Option<usize>,

    /// Keep everything in process memory (nothing survives a restart).
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let data_dir = args.data_dir
        .or_else(|| env::var("POINTSYNC_DATA_DIR").ok())
        .unwrap_or_else(|| "data".to_string());

    let port = args.port
        .or_else(|| env::var("POINTSYNC_PORT").ok())
        .unwrap_or_else(|| "7070".to_string());

    let mut store_config = StoreConfig::default();
    if let Some(max) = args.cache_max_keys {
        store_config.cache_max_keys = max;
    }

    let durable: Arc<dyn Durable> = if args.in_memory {
        Arc::new(MemoryDurable::new())
    } else {
        Arc::new(Persistence::new(&data_dir)?)
    };
    let store = Arc::new(Store::new(durable, store_config));
    let hub = Arc::new(Hub::new(store, HubConfig::default()));

    // Fail fast on unreadable or corrupt data instead of serving empty state.
    let snapshot = hub.snapshot().await?;

    let router = Router::new(hub.clone(), args.max_connections);

    println!("Starting Pointsync Hub...");
    println!(
        "Loaded {} collections ({} accounts) from {}.",
        snapshot.len(),
        snapshot.get(USERS).map(|u| u.len()).unwrap_or(0),
        if args.in_memory { "memory" } else { data_dir.as_str() }
    );
    println!("Pointsync listening on :{} (TCP)", port);

    tokio::select! {
        res = router.listen(&port) => {
            if let Err(e) = res {
                eprintln!("TCP Server failed: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            // Every acknowledged write is already on disk.
            println!("\nShutdown signal received. Exiting.");
        }
    }

    Ok(())
}

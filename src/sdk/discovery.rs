use std::env;
use std::sync::Arc;
use crate::engine::{Persistence, Store, StoreConfig};
use crate::hub::{Hub, HubConfig};
use crate::sdk::Client;
use crate::{Result, SyncApi};

/// Environment variable naming a running daemon, e.g. `127.0.0.1:7070`.
pub const ADDR_ENV: &str = "POINTSYNC_ADDR";

/// Opens the shared state either remotely or embedded.
///
/// 1. If `POINTSYNC_ADDR` is set and the daemon answers, returns a remote
///    [`Client`] (**Remote Mode**).
/// 2. Otherwise opens a [`Hub`] over a file-backed [`Store`] in `data_dir`
///    (**Embedded Mode**). Embedded writes are not seen by a daemon running
///    on the same directory until that daemon's cache is cold.
///
/// # Examples
///
/// ```no_run
/// use pointsync::{sdk, SyncApi};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let api = sdk::open("./data").await?;
///     let snapshot = api.snapshot().await?;
///     println!("{} collections", snapshot.len());
///     Ok(())
/// }
/// ```
pub async fn open(data_dir: &str) -> Result<Arc<dyn SyncApi>> {
    if let Ok(addr) = env::var(ADDR_ENV) {
        if !addr.is_empty() {
            match Client::connect(&addr).await {
                Ok(client) => return Ok(Arc::new(client)),
                Err(e) => log::warn!("Could not reach {} ({}), falling back to embedded mode", addr, e),
            }
        }
    }

    let persistence = Arc::new(Persistence::new(data_dir)?);
    let store = Arc::new(Store::new(persistence, StoreConfig::default()));
    Ok(Arc::new(Hub::new(store, HubConfig::default())))
}

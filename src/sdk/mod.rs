/// Software Development Kit (SDK) for pointsync.
///
/// This module provides the remote TCP client with its local state mirror,
/// and discovery that picks between remote and embedded mode.
pub mod client;
/// Automatic mode discovery.
pub mod discovery;

pub use client::{Client, ClientState};
pub use discovery::open;

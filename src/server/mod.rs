/// TCP server implementation for the pointsync daemon.
///
/// This module provides the [`Router`] which accepts client connections and
/// wires each one to the shared [`Hub`](crate::hub::Hub).
pub mod router;

pub use router::Router;

pub mod allocator;
pub mod persistence;
pub mod store;

pub use persistence::{Durable, MemoryDurable, Persistence};
pub use store::{Store, StoreConfig};

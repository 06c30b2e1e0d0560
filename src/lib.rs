//! Pointsync keeps every connected dashboard session looking at the same copy
//! of the school's shared point/reward state.
//!
//! All durable state is a handful of named collections, each a JSON array of
//! documents stored under one key. Clients replace whole collections or patch
//! single accounts; the hub writes through the store and rebroadcasts the
//! result to everyone, the sender included.
//!
//! ## Core Components
//! - [`engine`]: The collection store (cache + durable layer) and the access-code allocator.
//! - [`hub`]: The realtime sync hub, its wire protocol and the authorization gate.
//! - [`server`]: TCP daemon transport for the hub.
//! - [`sdk`]: Remote client with a local mirror, plus embedded/remote discovery.

pub mod engine;
pub mod hub;
pub mod sdk;
pub mod server;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by the sync core.
#[derive(Error, Debug)]
pub enum Error {
    /// The durable layer could not be read or written.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    /// The allocator found no free prime code within its budget.
    #[error("access code space exhausted after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
    /// The caller may not invoke a privileged operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// A granular operation targeted a document id that does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The collection name is not part of the persisted layout.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    /// The request payload is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred during network communication.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for pointsync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// One record inside a collection. Documents are shared and immutable;
/// changing one means building a new value (see [`engine::Store::get`]).
pub type Document = Arc<serde_json::Value>;

/// A complete collection value: the unit of storage and of full-replace mutations.
pub type Collection = Vec<Document>;

/// Field map carried by granular account patches.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Every collection keyed by name, as sent in the init snapshot.
pub type Snapshot = BTreeMap<String, Collection>;

/// Storage key of the Account collection.
pub const USERS: &str = "users";

/// The persisted layout: one durable key per collection.
pub const COLLECTIONS: &[&str] = &[
    USERS,
    "classes",
    "tasks",
    "rewards",
    "completions",
    "messages",
    "redemptions",
];

/// Returns true if `name` is one of [`COLLECTIONS`].
pub fn is_known_collection(name: &str) -> bool {
    COLLECTIONS.contains(&name)
}

/// Account roles. The set is closed; unknown strings in stored documents
/// simply fail to parse and are treated as unprivileged and unguarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Parent,
    Student,
}

impl Role {
    /// Roles whose access codes must be prime and pairwise unique.
    pub const CODE_GUARDED: &'static [Role] = &[Role::Student, Role::Parent];

    /// Parses the `role` field of an account document.
    pub fn of(account: &serde_json::Value) -> Option<Role> {
        account
            .get("role")
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())
    }

    pub fn is_code_guarded(self) -> bool {
        Self::CODE_GUARDED.contains(&self)
    }
}

/// Returns the string `id` of a document, if it has one.
pub fn doc_id(doc: &serde_json::Value) -> Option<&str> {
    doc.get("id").and_then(|v| v.as_str())
}

/// The operations a client can perform against shared state.
///
/// Implemented by the embedded [`hub::Hub`] and by the remote [`sdk::Client`],
/// so tools can run against either.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Reads every collection as of this instant.
    async fn snapshot(&self) -> Result<Snapshot>;
    /// Overwrites a whole collection and broadcasts it.
    async fn replace_collection(&self, name: &str, value: Collection) -> Result<()>;
    /// Shallow-merges `fields` into the account with `id` and broadcasts the delta.
    async fn patch_account(&self, id: &str, fields: Fields) -> Result<()>;
    /// Appends an account, allocating an access code if it has none.
    async fn add_account(&self, account: serde_json::Value) -> Result<()>;
    /// Removes the account with `id`.
    async fn remove_account(&self, id: &str) -> Result<()>;
    /// Privileged: re-issues codes for every code-guarded account. Returns the count updated.
    async fn reallocate_codes(&self, requester_id: &str) -> Result<usize>;
    /// Appends many accounts at once, allocating codes where missing. Returns the count added.
    async fn import_accounts(&self, accounts: Vec<serde_json::Value>) -> Result<usize>;
}

//! Wire messages exchanged between the hub and its clients.
//!
//! Every message is one JSON object per line, tagged by `"type"`.
//!
//! ### Client → Server
//! ```json
//! {"type": "replace_collection", "request_id": 1, "name": "tasks", "value": [...]}
//! {"type": "patch_account", "request_id": 2, "id": "s1", "fields": {"points": 5}}
//! {"type": "add_account", "request_id": 3, "account": {"id": "s2", "role": "student"}}
//! {"type": "remove_account", "request_id": 4, "id": "s2"}
//! {"type": "reallocate_codes", "request_id": 5, "requester_id": "a1"}
//! {"type": "import_accounts", "request_id": 6, "accounts": [...]}
//! {"type": "ping", "request_id": 7}
//! ```
//!
//! ### Server → Client
//! ```json
//! {"type": "init", "collections": {"users": [...], "tasks": [...]}}
//! {"type": "collection_replaced", "name": "tasks", "value": [...]}
//! {"type": "account_patched", "id": "s1", "fields": {"points": 5}}
//! {"type": "account_added", "account": {...}}
//! {"type": "account_removed", "id": "s2"}
//! {"type": "reply", "request_id": 5, "success": true, "count": 12}
//! ```

use serde::{Deserialize, Serialize};
use crate::{Collection, Document, Fields, Snapshot};

/// Requests sent by a client. Each carries a `request_id` echoed in the reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ReplaceCollection {
        request_id: u64,
        name: String,
        value: Collection,
    },
    PatchAccount {
        request_id: u64,
        id: String,
        fields: Fields,
    },
    AddAccount {
        request_id: u64,
        account: serde_json::Value,
    },
    RemoveAccount {
        request_id: u64,
        id: String,
    },
    /// Privileged. `requester_id` is the caller's claimed account id.
    ReallocateCodes {
        request_id: u64,
        requester_id: String,
    },
    ImportAccounts {
        request_id: u64,
        accounts: Vec<serde_json::Value>,
    },
    Ping {
        request_id: u64,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> u64 {
        match self {
            ClientMessage::ReplaceCollection { request_id, .. }
            | ClientMessage::PatchAccount { request_id, .. }
            | ClientMessage::AddAccount { request_id, .. }
            | ClientMessage::RemoveAccount { request_id, .. }
            | ClientMessage::ReallocateCodes { request_id, .. }
            | ClientMessage::ImportAccounts { request_id, .. }
            | ClientMessage::Ping { request_id } => *request_id,
        }
    }
}

/// Messages pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once per connection, right after it is accepted.
    Init {
        collections: Snapshot,
    },
    CollectionReplaced {
        name: String,
        value: Collection,
    },
    /// Receivers shallow-merge `fields` into the account with `id`.
    AccountPatched {
        id: String,
        fields: Fields,
    },
    AccountAdded {
        account: Document,
    },
    AccountRemoved {
        id: String,
    },
    /// Answer to one request, sent only to its requester.
    Reply {
        request_id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ServerMessage {
    /// Builds the reply for a finished request.
    pub fn reply(request_id: u64, outcome: &crate::Result<Option<usize>>) -> Self {
        match outcome {
            Ok(count) => ServerMessage::Reply {
                request_id,
                success: true,
                count: *count,
                error: None,
            },
            Err(e) => ServerMessage::Reply {
                request_id,
                success: false,
                count: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// True for messages that go to every connection.
    pub fn is_broadcast(&self) -> bool {
        !matches!(self, ServerMessage::Init { .. } | ServerMessage::Reply { .. })
    }
}

//! The realtime sync hub.
//!
//! The hub owns the write path: it applies client mutations through the
//! [`Store`] and only after the store acknowledges the write does it
//! broadcast the result to every subscriber, the originator included.
//!
//! ## Consistency
//!
//! Full-replace mutations are last-write-wins at the collection level. Two
//! clients replacing the same collection from the same baseline will lose one
//! of the two edits; that is accepted behavior. Granular account operations
//! are read-modify-write sequences run inside the store's per-key exclusive
//! section, so they never lose each other's fields.

pub mod gate;
pub mod protocol;

pub use gate::Gate;
pub use protocol::{ClientMessage, ServerMessage};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use async_trait::async_trait;
use futures::future::try_join_all;
use log::{debug, error, info, warn};
use rand::Rng;
use tokio::sync::broadcast;
use crate::engine::allocator::{self, ACCESS_CODE};
use crate::engine::Store;
use crate::{
    doc_id, is_known_collection, Collection, Document, Error, Fields, Result, Role, Snapshot,
    SyncApi, COLLECTIONS, USERS,
};

/// Configuration for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Broadcast channel capacity. Slower subscribers are re-seeded with a snapshot.
    pub channel_capacity: usize,
    /// Roles allowed to run privileged operations.
    pub privileged_roles: Vec<Role>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            privileged_roles: gate::DEFAULT_PRIVILEGED_ROLES.to_vec(),
        }
    }
}

pub struct Hub {
    store: Arc<Store>,
    gate: Gate,
    tx: broadcast::Sender<ServerMessage>,
}

impl Hub {
    pub fn new(store: Arc<Store>, config: HubConfig) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity);
        Self {
            store,
            gate: Gate::new(config.privileged_roles),
            tx,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Subscribes to every broadcast issued after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    /// Builds the init message for a newly connected client.
    pub async fn init_message(&self) -> Result<ServerMessage> {
        Ok(ServerMessage::Init {
            collections: self.snapshot().await?,
        })
    }

    /// Runs one client request and returns the reply destined for its sender.
    pub async fn handle(&self, msg: ClientMessage) -> ServerMessage {
        let request_id = msg.request_id();
        let outcome = match msg {
            ClientMessage::ReplaceCollection { name, value, .. } => {
                self.replace_collection(&name, value).await.map(|_| None)
            }
            ClientMessage::PatchAccount { id, fields, .. } => {
                self.patch_account(&id, fields).await.map(|_| None)
            }
            ClientMessage::AddAccount { account, .. } => {
                self.add_account(account).await.map(|_| None)
            }
            ClientMessage::RemoveAccount { id, .. } => {
                self.remove_account(&id).await.map(|_| None)
            }
            ClientMessage::ReallocateCodes { requester_id, .. } => {
                self.reallocate_codes(&requester_id).await.map(Some)
            }
            ClientMessage::ImportAccounts { accounts, .. } => {
                self.import_accounts(accounts).await.map(Some)
            }
            ClientMessage::Ping { .. } => Ok(None),
        };

        if let Err(e) = &outcome {
            match e {
                Error::StorageUnavailable(_) | Error::Internal(_) => {
                    error!("Request {} failed: {}", request_id, e)
                }
                _ => warn!("Request {} rejected: {}", request_id, e),
            }
        }
        ServerMessage::reply(request_id, &outcome)
    }

    pub(crate) fn broadcast(&self, msg: ServerMessage) {
        // Send only fails when nobody is listening.
        match self.tx.send(msg) {
            Ok(n) => debug!("Broadcast delivered to {} subscribers", n),
            Err(_) => debug!("Broadcast dropped: no subscribers"),
        }
    }
}

/// Validates a new account and reserves its id and code, allocating a code
/// when the document carries none.
fn admit_account<R: Rng + ?Sized>(
    rng: &mut R,
    account: &mut serde_json::Value,
    ids: &mut HashSet<String>,
    excluded: &mut HashSet<String>,
) -> Result<()> {
    if !account.is_object() {
        return Err(Error::InvalidRequest("account must be a JSON object".to_string()));
    }
    let id = doc_id(account)
        .ok_or_else(|| Error::InvalidRequest("account needs a string id".to_string()))?
        .to_string();
    if !ids.insert(id.clone()) {
        return Err(Error::InvalidRequest(format!("duplicate account id {}", id)));
    }

    let given = account
        .get(ACCESS_CODE)
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    match given {
        Some(code) => {
            let guarded = Role::of(account).map(Role::is_code_guarded).unwrap_or(false);
            if guarded && (!allocator::is_valid_code(&code) || excluded.contains(&code)) {
                return Err(Error::InvalidRequest(format!("access code for {} is invalid or taken", id)));
            }
            excluded.insert(code);
        }
        None => {
            allocator::assign_if_missing(rng, account, excluded)?;
        }
    }
    Ok(())
}

/// Validates a whole Account collection: string ids are unique, and every
/// code-guarded account holds a prime code no other account holds.
fn check_accounts(accounts: &[Document]) -> Result<()> {
    let mut ids = HashSet::new();
    for account in accounts {
        let id = doc_id(account)
            .ok_or_else(|| Error::InvalidRequest("every account needs a string id".to_string()))?;
        if !ids.insert(id) {
            return Err(Error::InvalidRequest(format!("duplicate account id {}", id)));
        }
    }

    let held: Vec<Option<&str>> = accounts
        .iter()
        .map(|a| a.get(ACCESS_CODE).and_then(|c| c.as_str()))
        .collect();
    for (index, account) in accounts.iter().enumerate() {
        if !Role::of(account).map(Role::is_code_guarded).unwrap_or(false) {
            continue;
        }
        let id = doc_id(account).unwrap_or_default();
        let code = held[index].unwrap_or("");
        if !allocator::is_valid_code(code) {
            return Err(Error::InvalidRequest(format!("access code {:?} of {} is not a four-digit prime", code, id)));
        }
        let shared = held
            .iter()
            .enumerate()
            .any(|(other, c)| other != index && *c == Some(code));
        if shared {
            return Err(Error::InvalidRequest(format!("access code {} of {} is already in use", code, id)));
        }
    }
    Ok(())
}

/// Rejects patches that would break account identity or code uniqueness.
fn check_patch(accounts: &[Document], index: usize, merged: &serde_json::Value, id: &str) -> Result<()> {
    if doc_id(merged) != Some(id) {
        return Err(Error::InvalidRequest("account id cannot be patched".to_string()));
    }
    let guarded = Role::of(merged).map(Role::is_code_guarded).unwrap_or(false);
    if !guarded {
        return Ok(());
    }
    let code = merged.get(ACCESS_CODE).and_then(|c| c.as_str()).unwrap_or("");
    if !allocator::is_valid_code(code) {
        return Err(Error::InvalidRequest(format!("access code {:?} is not a four-digit prime", code)));
    }
    let taken = accounts
        .iter()
        .enumerate()
        .any(|(i, a)| i != index && a.get(ACCESS_CODE).and_then(|c| c.as_str()) == Some(code));
    if taken {
        return Err(Error::InvalidRequest(format!("access code {} is already in use", code)));
    }
    Ok(())
}

#[async_trait]
impl SyncApi for Hub {
    async fn snapshot(&self) -> Result<Snapshot> {
        let reads = COLLECTIONS.iter().map(|name| async move {
            let value = self.store.get(name, Vec::new()).await?;
            Ok::<_, Error>((name.to_string(), value))
        });
        let collections: BTreeMap<String, Collection> = try_join_all(reads).await?.into_iter().collect();
        Ok(collections)
    }

    async fn replace_collection(&self, name: &str, value: Collection) -> Result<()> {
        if !is_known_collection(name) {
            return Err(Error::UnknownCollection(name.to_string()));
        }
        if name == USERS {
            check_accounts(&value)?;
        }
        self.store.set(name, value.clone()).await?;
        self.broadcast(ServerMessage::CollectionReplaced {
            name: name.to_string(),
            value,
        });
        Ok(())
    }

    async fn patch_account(&self, id: &str, fields: Fields) -> Result<()> {
        let patch = fields.clone();
        self.store
            .update(USERS, Vec::new(), |users| {
                let index = users
                    .iter()
                    .position(|a| doc_id(a) == Some(id))
                    .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

                let mut merged = (*users[index]).clone();
                let obj = merged
                    .as_object_mut()
                    .ok_or_else(|| Error::Internal(format!("account {} is not an object", id)))?;
                for (k, v) in patch {
                    obj.insert(k, v);
                }
                check_patch(users, index, &merged, id)?;
                users[index] = Arc::new(merged);
                Ok(())
            })
            .await?;

        self.broadcast(ServerMessage::AccountPatched {
            id: id.to_string(),
            fields,
        });
        Ok(())
    }

    async fn add_account(&self, account: serde_json::Value) -> Result<()> {
        let added = self
            .store
            .update(USERS, Vec::new(), |users| {
                let mut ids: HashSet<String> = users.iter().filter_map(|a| doc_id(a).map(str::to_string)).collect();
                let mut excluded = allocator::codes_in_use(users);
                let mut account = account;
                admit_account(&mut rand::thread_rng(), &mut account, &mut ids, &mut excluded)?;
                let doc = Arc::new(account);
                users.push(doc.clone());
                Ok(doc)
            })
            .await?;

        self.broadcast(ServerMessage::AccountAdded { account: added });
        Ok(())
    }

    async fn remove_account(&self, id: &str) -> Result<()> {
        self.store
            .update(USERS, Vec::new(), |users| {
                let before = users.len();
                users.retain(|a| doc_id(a) != Some(id));
                if users.len() == before {
                    return Err(Error::NotFound(format!("account {}", id)));
                }
                Ok(())
            })
            .await?;

        self.broadcast(ServerMessage::AccountRemoved { id: id.to_string() });
        Ok(())
    }

    async fn reallocate_codes(&self, requester_id: &str) -> Result<usize> {
        let (count, users) = self
            .store
            .update(USERS, Vec::new(), |users| {
                self.gate.authorize(users, requester_id)?;
                let count = allocator::reallocate_guarded(&mut rand::thread_rng(), users)?;
                Ok((count, users.clone()))
            })
            .await?;

        info!("Reallocated {} access codes on behalf of {}", count, requester_id);
        self.broadcast(ServerMessage::CollectionReplaced {
            name: USERS.to_string(),
            value: users,
        });
        Ok(count)
    }

    async fn import_accounts(&self, accounts: Vec<serde_json::Value>) -> Result<usize> {
        let (count, users) = self
            .store
            .update(USERS, Vec::new(), |users| {
                let mut ids: HashSet<String> = users.iter().filter_map(|a| doc_id(a).map(str::to_string)).collect();
                let mut excluded = allocator::codes_in_use(users);
                let mut rng = rand::thread_rng();
                let count = accounts.len();
                for mut account in accounts {
                    admit_account(&mut rng, &mut account, &mut ids, &mut excluded)?;
                    users.push(Arc::new(account));
                }
                Ok((count, users.clone()))
            })
            .await?;

        info!("Imported {} accounts", count);
        self.broadcast(ServerMessage::CollectionReplaced {
            name: USERS.to_string(),
            value: users,
        });
        Ok(count)
    }
}

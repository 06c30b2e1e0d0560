use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use crate::engine::allocator::ATTEMPT_BUDGET;
use crate::hub::{ClientMessage, ServerMessage};
use crate::{doc_id, Collection, Error, Fields, Result, Snapshot, SyncApi, USERS};

/// Local copy of shared state, kept current by applying server messages.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ClientState {
    pub collections: Snapshot,
}

impl ClientState {
    /// Applies one server message. Replies leave the state untouched.
    ///
    /// Every delta is idempotent: a broadcast that raced the init snapshot
    /// may arrive for a change the snapshot already contains.
    pub fn apply(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Init { collections } => self.collections = collections.clone(),
            ServerMessage::CollectionReplaced { name, value } => {
                self.collections.insert(name.clone(), value.clone());
            }
            ServerMessage::AccountPatched { id, fields } => {
                let users = self.collections.entry(USERS.to_string()).or_default();
                if let Some(doc) = users.iter_mut().find(|a| doc_id(a) == Some(id.as_str())) {
                    if let Some(obj) = Arc::make_mut(doc).as_object_mut() {
                        for (k, v) in fields {
                            obj.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            ServerMessage::AccountAdded { account } => {
                let users = self.collections.entry(USERS.to_string()).or_default();
                let id = doc_id(account);
                match users.iter_mut().find(|a| id.is_some() && doc_id(a) == id) {
                    Some(existing) => *existing = account.clone(),
                    None => users.push(account.clone()),
                }
            }
            ServerMessage::AccountRemoved { id } => {
                if let Some(users) = self.collections.get_mut(USERS) {
                    users.retain(|a| doc_id(a) != Some(id.as_str()));
                }
            }
            ServerMessage::Reply { .. } => {}
        }
    }

    pub fn collection(&self, name: &str) -> Collection {
        self.collections.get(name).cloned().unwrap_or_default()
    }
}

// `None` once the reader has stopped; no request can be registered after that.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<ServerMessage>>>>>;

/// Rebuilds the typed error from a failed reply's text.
fn reply_error(message: String) -> Error {
    let stripped = |prefix: &str| message.strip_prefix(prefix).map(str::to_string);
    if let Some(rest) = stripped("Unauthorized: ") {
        Error::Unauthorized(rest)
    } else if let Some(rest) = stripped("not found: ") {
        Error::NotFound(rest)
    } else if let Some(rest) = stripped("invalid request: ") {
        Error::InvalidRequest(rest)
    } else if let Some(rest) = stripped("unknown collection: ") {
        Error::UnknownCollection(rest)
    } else if let Some(rest) = stripped("storage unavailable: ") {
        Error::StorageUnavailable(rest)
    } else if message.starts_with("access code space exhausted") {
        Error::CodeSpaceExhausted { attempts: ATTEMPT_BUDGET }
    } else {
        Error::Internal(message)
    }
}

/// Remote connection to a pointsync daemon.
///
/// A background task reads every server line: replies resolve the request
/// waiting on their `request_id`, everything else is applied to the mirror.
pub struct Client {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    state: Arc<RwLock<ClientState>>,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl Client {
    /// Connects and waits for the init snapshot.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Internal("connection closed before init".to_string()));
        }
        let init: ServerMessage = serde_json::from_str(line.trim())?;
        if !matches!(init, ServerMessage::Init { .. }) {
            return Err(Error::Internal("expected init snapshot".to_string()));
        }
        let mut state = ClientState::default();
        state.apply(&init);

        let state = Arc::new(RwLock::new(state));
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader_task = tokio::spawn(read_loop(reader, state.clone(), pending.clone()));

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            state,
            next_id: AtomicU64::new(1),
            reader_task,
        })
    }

    /// A copy of the mirrored state as of now.
    pub fn state(&self) -> ClientState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request(&self, msg: ClientMessage) -> Result<Option<usize>> {
        let request_id = msg.request_id();
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().await.as_mut() {
            Some(pending) => pending.insert(request_id, tx),
            None => return Err(Error::Internal("connection closed".to_string())),
        };

        let mut bytes = serde_json::to_vec(&msg)?;
        bytes.push(b'\n');
        if let Err(e) = self.writer.lock().await.write_all(&bytes).await {
            if let Some(pending) = self.pending.lock().await.as_mut() {
                pending.remove(&request_id);
            }
            return Err(e.into());
        }

        match rx.await {
            Ok(ServerMessage::Reply { success: true, count, .. }) => Ok(count),
            Ok(ServerMessage::Reply { error, .. }) => {
                Err(reply_error(error.unwrap_or_else(|| "request failed".to_string())))
            }
            Ok(_) => Err(Error::Internal("Invalid response".to_string())),
            Err(_) => Err(Error::Internal("connection closed".to_string())),
        }
    }

    /// Round-trips a ping.
    pub async fn ping(&self) -> Result<()> {
        self.request(ClientMessage::Ping { request_id: self.next_request_id() }).await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, state: Arc<RwLock<ClientState>>, pending: Pending) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let msg: ServerMessage = match serde_json::from_str(line.trim()) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Ignoring unparseable server message: {}", e);
                continue;
            }
        };
        if let ServerMessage::Reply { request_id, .. } = &msg {
            let waiter = pending.lock().await.as_mut().and_then(|p| p.remove(request_id));
            if let Some(tx) = waiter {
                let _ = tx.send(msg);
            }
            continue;
        }
        state.write().unwrap_or_else(PoisonError::into_inner).apply(&msg);
    }
    // Dropping the senders fails every outstanding request, and later
    // requests see the connection as closed.
    *pending.lock().await = None;
}

#[async_trait]
impl SyncApi for Client {
    async fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.state().collections)
    }

    async fn replace_collection(&self, name: &str, value: Collection) -> Result<()> {
        self.request(ClientMessage::ReplaceCollection {
            request_id: self.next_request_id(),
            name: name.to_string(),
            value,
        })
        .await?;
        Ok(())
    }

    async fn patch_account(&self, id: &str, fields: Fields) -> Result<()> {
        self.request(ClientMessage::PatchAccount {
            request_id: self.next_request_id(),
            id: id.to_string(),
            fields,
        })
        .await?;
        Ok(())
    }

    async fn add_account(&self, account: serde_json::Value) -> Result<()> {
        self.request(ClientMessage::AddAccount {
            request_id: self.next_request_id(),
            account,
        })
        .await?;
        Ok(())
    }

    async fn remove_account(&self, id: &str) -> Result<()> {
        self.request(ClientMessage::RemoveAccount {
            request_id: self.next_request_id(),
            id: id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn reallocate_codes(&self, requester_id: &str) -> Result<usize> {
        let count = self
            .request(ClientMessage::ReallocateCodes {
                request_id: self.next_request_id(),
                requester_id: requester_id.to_string(),
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn import_accounts(&self, accounts: Vec<serde_json::Value>) -> Result<usize> {
        let count = self
            .request(ClientMessage::ImportAccounts {
                request_id: self.next_request_id(),
                accounts,
            })
            .await?;
        Ok(count.unwrap_or(0))
    }
}

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::{RecvError, TryRecvError}};
use tokio::sync::Semaphore;
use log::{debug, error, info, warn};
use crate::hub::{ClientMessage, Hub, ServerMessage};
use crate::Result;

pub struct Router {
    hub: Arc<Hub>,
    semaphore: Arc<Semaphore>,
}

impl Router {
    pub fn new(hub: Arc<Hub>, max_connections: usize) -> Self {
        Self {
            hub,
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub async fn listen(&self, port: &str) -> Result<()> {
        let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        info!("Pointsync hub listening on port {}", port);
        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until it fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let hub = self.hub.clone();
            let sem = self.semaphore.clone();

            tokio::spawn(async move {
                let _permit = match sem.try_acquire() {
                    Ok(p) => p,
                    Err(_) => {
                        error!("Server busy: too many concurrent connections. Rejecting {}", peer);
                        let mut socket = socket;
                        let _ = socket.shutdown().await;
                        return;
                    }
                };

                info!("Client {} connected", peer);
                if let Err(e) = handle_connection(socket, hub).await {
                    error!("Connection {} error: {}", peer, e);
                }
                info!("Client {} disconnected", peer);
            });
        }
    }
}

async fn send(writer: &mut OwnedWriteHalf, msg: &ServerMessage) -> Result<()> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

// Best effort, so a malformed request can still be answered under its own id.
fn request_id_hint(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("request_id").and_then(|id| id.as_u64()))
        .unwrap_or(0)
}

/// Replaces a lagging client's view with a fresh snapshot.
///
/// Broadcasts still queued were committed before the snapshot is read, so the
/// receiver is swapped for a fresh one first; nothing older than the snapshot
/// reaches the client afterwards.
async fn reseed(
    writer: &mut OwnedWriteHalf,
    broadcasts: &mut broadcast::Receiver<ServerMessage>,
    hub: &Hub,
    skipped: u64,
) -> Result<()> {
    warn!("Client fell {} broadcasts behind, re-sending snapshot", skipped);
    *broadcasts = broadcasts.resubscribe();
    send(writer, &hub.init_message().await?).await
}

async fn forward_pending(
    writer: &mut OwnedWriteHalf,
    broadcasts: &mut broadcast::Receiver<ServerMessage>,
    hub: &Hub,
) -> Result<()> {
    loop {
        match broadcasts.try_recv() {
            Ok(msg) => send(writer, &msg).await?,
            Err(TryRecvError::Lagged(skipped)) => reseed(writer, broadcasts, hub, skipped).await?,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
        }
    }
}

/// Serves one client: an init snapshot, then requests and broadcasts
/// interleaved until the client hangs up.
pub async fn handle_connection(socket: TcpStream, hub: Arc<Hub>) -> Result<()> {
    // Subscribe first so nothing committed after the snapshot is missed.
    let mut broadcasts = hub.subscribe();
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    send(&mut writer, &hub.init_message().await?).await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let reply = match serde_json::from_str::<ClientMessage>(line) {
                    Ok(msg) => hub.handle(msg).await,
                    Err(e) => {
                        debug!("Unparseable request: {}", e);
                        ServerMessage::Reply {
                            request_id: request_id_hint(line),
                            success: false,
                            count: None,
                            error: Some(format!("invalid message: {}", e)),
                        }
                    }
                };
                // The requester sees its own broadcast before the reply.
                forward_pending(&mut writer, &mut broadcasts, &hub).await?;
                send(&mut writer, &reply).await?;
            }
            msg = broadcasts.recv() => match msg {
                Ok(msg) => send(&mut writer, &msg).await?,
                Err(RecvError::Lagged(skipped)) => {
                    reseed(&mut writer, &mut broadcasts, &hub, skipped).await?;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryDurable, Store, StoreConfig};
    use crate::hub::HubConfig;
    use crate::SyncApi;
    use serde_json::json;

    fn tasks(title: &str) -> crate::Collection {
        vec![Arc::new(json!({"id": "t1", "title": title}))]
    }

    #[tokio::test]
    async fn test_lagging_client_gets_only_the_fresh_snapshot() {
        let store = Arc::new(Store::new(Arc::new(MemoryDurable::new()), StoreConfig::default()));
        let config = HubConfig { channel_capacity: 1, ..HubConfig::default() };
        let hub = Hub::new(store, config);
        let mut broadcasts = hub.subscribe();

        hub.replace_collection("tasks", tasks("A")).await.unwrap();
        hub.replace_collection("tasks", tasks("B")).await.unwrap();
        hub.replace_collection("tasks", tasks("C")).await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let (_server_read, mut writer) = server_side.into_split();

        forward_pending(&mut writer, &mut broadcasts, &hub).await.unwrap();
        drop(writer);

        let mut lines = BufReader::new(client).lines();
        let mut received = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            received.push(serde_json::from_str::<ServerMessage>(&line).unwrap());
        }

        assert_eq!(received.len(), 1, "got {:?}", received);
        match &received[0] {
            ServerMessage::Init { collections } => assert_eq!(collections["tasks"], tasks("C")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_request_id_hint() {
        assert_eq!(request_id_hint(r#"{"type":"bogus","request_id":12}"#), 12);
        assert_eq!(request_id_hint("not json"), 0);
    }
}

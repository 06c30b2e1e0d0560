use pointsync::engine::{MemoryDurable, Persistence, Store, StoreConfig};
use pointsync::hub::{Hub, HubConfig, ServerMessage};
use pointsync::sdk::Client;
use pointsync::server::Router;
use pointsync::{Error, SyncApi, USERS};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

async fn start_server(hub: Arc<Hub>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let router = Router::new(hub, 16);
        let _ = router.serve(listener).await;
    });
    addr
}

fn memory_hub() -> Arc<Hub> {
    let store = Arc::new(Store::new(Arc::new(MemoryDurable::new()), StoreConfig::default()));
    Arc::new(Hub::new(store, HubConfig::default()))
}

async fn seeded_hub() -> Arc<Hub> {
    let hub = memory_hub();
    hub.replace_collection(
        USERS,
        vec![
            Arc::new(json!({"id": "a1", "role": "admin", "accessCode": "0002"})),
            Arc::new(json!({"id": "t1", "role": "teacher", "accessCode": "0003"})),
            Arc::new(json!({"id": "s1", "role": "student", "accessCode": "0005", "points": 10})),
            Arc::new(json!({"id": "p1", "role": "parent", "accessCode": "0007"})),
        ],
    )
    .await
    .unwrap();
    hub
}

struct RawConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawConn {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self { reader: BufReader::new(reader), writer }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for server")
            .unwrap();
        serde_json::from_str(line.trim()).unwrap()
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_raw_protocol_round_trip() {
    let addr = start_server(seeded_hub().await).await;

    let mut alice = RawConn::connect(addr).await;
    let init = alice.recv().await;
    assert_eq!(init["type"], json!("init"));
    assert_eq!(init["collections"]["users"].as_array().unwrap().len(), 4);
    assert_eq!(init["collections"]["tasks"], json!([]));

    let mut bob = RawConn::connect(addr).await;
    assert_eq!(bob.recv().await["type"], json!("init"));

    alice
        .send(r#"{"type":"replace_collection","request_id":1,"name":"tasks","value":[{"id":"t1","title":"Read"}]}"#)
        .await;

    // The sender gets the broadcast first, then its reply.
    let broadcast = alice.recv().await;
    assert_eq!(broadcast["type"], json!("collection_replaced"));
    assert_eq!(broadcast["name"], json!("tasks"));
    assert_eq!(
        alice.recv().await,
        json!({"type": "reply", "request_id": 1, "success": true})
    );

    let seen_by_bob = bob.recv().await;
    assert_eq!(seen_by_bob, broadcast);
}

#[tokio::test]
async fn test_granular_patch_sends_delta() {
    let addr = start_server(seeded_hub().await).await;

    let mut conn = RawConn::connect(addr).await;
    conn.recv().await;

    conn.send(r#"{"type":"patch_account","request_id":2,"id":"s1","fields":{"points":5}}"#).await;
    assert_eq!(
        conn.recv().await,
        json!({"type": "account_patched", "id": "s1", "fields": {"points": 5}})
    );
    assert_eq!(conn.recv().await["success"], json!(true));

    conn.send(r#"{"type":"patch_account","request_id":3,"id":"ghost","fields":{"points":5}}"#).await;
    let reply = conn.recv().await;
    assert_eq!(reply["request_id"], json!(3));
    assert_eq!(reply["success"], json!(false));
    assert!(reply["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_malformed_request_is_answered() {
    let addr = start_server(memory_hub()).await;

    let mut conn = RawConn::connect(addr).await;
    conn.recv().await;

    conn.send(r#"{"type":"launch_rockets","request_id":44}"#).await;
    let reply = conn.recv().await;
    assert_eq!(reply["request_id"], json!(44));
    assert_eq!(reply["success"], json!(false));

    conn.send("garbage").await;
    assert_eq!(conn.recv().await["request_id"], json!(0));
}

#[tokio::test]
async fn test_clients_stay_in_sync() {
    let addr = start_server(seeded_hub().await).await;
    let a = Client::connect(&addr.to_string()).await.unwrap();
    let b = Arc::new(Client::connect(&addr.to_string()).await.unwrap());

    a.patch_account("s1", json!({"points": 42}).as_object().cloned().unwrap()).await.unwrap();
    // The requester's mirror already reflects its own change.
    assert_eq!(a.state().collection(USERS)[2]["points"], json!(42));

    let b2 = b.clone();
    eventually(move || b2.state().collection(USERS)[2]["points"] == json!(42)).await;

    a.add_account(json!({"id": "s2", "role": "student"})).await.unwrap();
    let b2 = b.clone();
    eventually(move || b2.state().collection(USERS).len() == 5).await;
    let added = b.state().collection(USERS)[4].clone();
    assert!(pointsync::engine::allocator::is_valid_code(added["accessCode"].as_str().unwrap()));

    b.remove_account("s2").await.unwrap();
    assert_eq!(b.state().collection(USERS).len(), 4);
    a.ping().await.unwrap();
    assert_eq!(a.state(), b.state());
}

#[tokio::test]
async fn test_reallocation_over_the_wire() {
    let hub = seeded_hub().await;
    let addr = start_server(hub.clone()).await;
    let client = Client::connect(&addr.to_string()).await.unwrap();

    let before = serde_json::to_vec(&hub.snapshot().await.unwrap()[USERS]).unwrap();
    let err = client.reallocate_codes("t1").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)), "got {:?}", err);
    assert!(matches!(client.remove_account("ghost").await, Err(Error::NotFound(_))));
    let after = serde_json::to_vec(&hub.snapshot().await.unwrap()[USERS]).unwrap();
    assert_eq!(before, after);

    assert_eq!(client.reallocate_codes("a1").await.unwrap(), 2);
    let users = client.state().collection(USERS);
    assert_eq!(users[0]["accessCode"], json!("0002"));
    assert_eq!(users[1]["accessCode"], json!("0003"));
    assert_ne!(users[2]["accessCode"], users[3]["accessCode"]);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(Store::new(Arc::new(Persistence::new(dir.path()).unwrap()), StoreConfig::default()));
        let hub = Hub::new(store, HubConfig::default());
        hub.replace_collection("rewards", vec![Arc::new(json!({"id": "r1", "cost": 50}))]).await.unwrap();
        hub.add_account(json!({"id": "s1", "role": "student"})).await.unwrap();
    }

    let store = Arc::new(Store::new(Arc::new(Persistence::new(dir.path()).unwrap()), StoreConfig::default()));
    let hub = Hub::new(store, HubConfig::default());
    let snapshot = hub.snapshot().await.unwrap();
    assert_eq!(*snapshot["rewards"][0], json!({"id": "r1", "cost": 50}));
    assert_eq!(snapshot[USERS].len(), 1);

    match hub.init_message().await.unwrap() {
        ServerMessage::Init { collections } => assert_eq!(collections, snapshot),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_requests_fail_after_server_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"{\"type\":\"init\",\"collections\":{}}\n").await.unwrap();
        // Dropping the socket closes the connection right after init.
    });

    let client = Client::connect(&addr.to_string()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    for _ in 0..2 {
        let res = tokio::time::timeout(Duration::from_secs(3), client.ping())
            .await
            .expect("request hung after the server went away");
        assert!(res.is_err());
    }
}

//! End-to-end tests of mesh nodes talking over loopback TCP.

use hypercube_core::link::{native, LinkEnv};
use hypercube_core::{
    EdgeClient, EdgeClients, HandlerModule, MemoryStorage, Mesh, MeshError, MessageId, PeerLink,
    SaveMode, ServerDescriptor, ServerStatus, SessionToken, SqliteStorage,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn lobby() -> ServerDescriptor {
    ServerDescriptor::new("1", "lobby", "127.0.0.1").with_remote_port(0)
}

fn gate() -> ServerDescriptor {
    ServerDescriptor::new("1", "gate", "127.0.0.1").with_client_port(3010)
}

async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct TestClient {
    id: String,
    session: Mutex<Map<String, Value>>,
    inbox: Mutex<Vec<(String, Value)>>,
    closed: Mutex<Option<Value>>,
}

#[async_trait::async_trait]
impl EdgeClient for TestClient {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn session(&self) -> Map<String, Value> {
        self.session.lock().unwrap().clone()
    }

    fn set_session(&self, values: Map<String, Value>, cover: bool) {
        let mut session = self.session.lock().unwrap();
        if cover {
            session.clear();
        }
        session.extend(values);
    }

    async fn send(&self, action: &str, payload: Value, _id: MessageId) -> hypercube_core::Result<()> {
        self.inbox.lock().unwrap().push((action.to_string(), payload));
        Ok(())
    }

    async fn close(&self, reason: Value) {
        *self.closed.lock().unwrap() = Some(reason);
    }
}

struct TestEdge {
    clients: HashMap<String, Arc<TestClient>>,
}

impl EdgeClients for TestEdge {
    fn get_client(&self, cid: &str) -> Option<Arc<dyn EdgeClient>> {
        self.clients
            .get(cid)
            .map(|client| client.clone() as Arc<dyn EdgeClient>)
    }

    fn clients(&self) -> Vec<Arc<dyn EdgeClient>> {
        self.clients
            .values()
            .map(|client| client.clone() as Arc<dyn EdgeClient>)
            .collect()
    }
}

fn lobby_handlers() -> HandlerModule {
    HandlerModule::new()
        .route("echo", |req| async move { Ok(req.payload().clone()) })
        .unwrap()
        .route("join", |req| async move {
            let ctx = req.context()?;
            let session = req.session().clone();
            session.sync(&ctx).await?;
            let level = session.get("level").unwrap_or(Value::Null);
            session.set(json!({"room": 7}), false)?;
            session.save(&ctx, SaveMode::Append).await?;
            req.front_push("onJoin", Some(json!({"room": 7})));
            Ok(json!({"level": level}))
        })
        .unwrap()
        .route("kick", |req| async move {
            let ctx = req.context()?;
            let kicked = req.session().disconnect(&ctx, json!("afk")).await?;
            Ok(json!({"kicked": kicked}))
        })
        .unwrap()
}

/// Gate first so that the lobby sees it in storage when it starts.
async fn start_pair(storage: MemoryStorage, client: Arc<TestClient>) -> (Mesh, Mesh) {
    let edge = TestEdge {
        clients: HashMap::from([(client.id.clone(), client)]),
    };
    let gate = Mesh::builder(gate())
        .storage(storage.clone())
        .edge(Arc::new(edge))
        .build()
        .await
        .unwrap();
    let lobby = Mesh::builder(lobby())
        .storage(storage)
        .handler(lobby_handlers())
        .build()
        .await
        .unwrap();
    gate.registry().sync(None).await.unwrap();
    (gate, lobby)
}

#[tokio::test]
async fn test_request_round_trip_between_nodes() {
    let client = Arc::new(TestClient {
        id: "c1".into(),
        ..Default::default()
    });
    let (gate, lobby) = start_pair(MemoryStorage::new(), client).await;

    let target = gate.registry().dispatch("lobby", None).unwrap();
    assert_eq!(target.remote_port, lobby.local().remote_port);

    let reply = gate
        .pool()
        .request(&target, "echo", json!({"hello": [1, 2, 3]}), None)
        .await
        .unwrap();
    assert_eq!(reply, json!({"hello": [1, 2, 3]}));

    let err = gate
        .pool()
        .request(&target, "missing", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Remote { .. }));

    gate.shutdown().await.unwrap();
    lobby.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_reaches_back_to_origin_client() {
    let client = Arc::new(TestClient {
        id: "c1".into(),
        ..Default::default()
    });
    client.set_session(json!({"level": 12}).as_object().unwrap().clone(), true);
    let (gate, lobby) = start_pair(MemoryStorage::new(), client.clone()).await;

    let target = gate.registry().dispatch("lobby", None).unwrap();
    gate.pool().load(&target).await.unwrap();
    eventually(|| lobby.pool().get_link("gate", "1").is_some()).await;

    let token = SessionToken::new("1", "gate", "c1");
    let reply = gate
        .pool()
        .request(&target, "join", json!({}), Some(&token))
        .await
        .unwrap();
    assert_eq!(reply, json!({"level": 12}));

    // Saved into the edge client's session and pushed to the client.
    assert_eq!(client.session().get("room"), Some(&json!(7)));
    assert_eq!(client.session().get("level"), Some(&json!(12)));
    eventually(|| !client.inbox.lock().unwrap().is_empty()).await;
    let (action, payload) = client.inbox.lock().unwrap()[0].clone();
    assert_eq!(action, "onJoin");
    assert_eq!(payload, json!({"status": "ok", "room": 7}));

    let reply = gate
        .pool()
        .request(&target, "kick", json!({}), Some(&token))
        .await
        .unwrap();
    assert_eq!(reply, json!({"kicked": true}));
    assert_eq!(*client.closed.lock().unwrap(), Some(json!("afk")));

    gate.shutdown().await.unwrap();
    lobby.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_incomplete_token_cannot_reach_origin() {
    let mesh = Mesh::builder(lobby())
        .storage(MemoryStorage::new())
        .build()
        .await
        .unwrap();
    let ctx = mesh.context();

    let wire = serde_json::from_value(json!({"sid": 1, "sgroup": "lobby"})).unwrap();
    let token = SessionToken::from_wire(wire);
    assert!(!token.is_created());

    assert!(matches!(token.sync(&ctx).await, Err(MeshError::NoCreate)));
    assert!(matches!(
        token.save(&ctx, SaveMode::Cover).await,
        Err(MeshError::NoCreate)
    ));
    assert!(matches!(
        token
            .push_message(&ctx, "notice", json!({}), MessageId::default())
            .await,
        Err(MeshError::NoCreate)
    ));
    assert!(matches!(
        token.disconnect(&ctx, Value::Null).await,
        Err(MeshError::NoCreate)
    ));

    mesh.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_link_from_same_server_is_rejected() {
    let lobby = Mesh::builder(lobby())
        .storage(MemoryStorage::new())
        .handler(lobby_handlers())
        .build()
        .await
        .unwrap();
    let target = lobby.local().clone();
    let me = ServerDescriptor::new("9", "gate", "127.0.0.1").with_client_port(3019);

    let first = PeerLink::connect_to(target.clone(), LinkEnv::new(me.clone()));
    first.push("echo", json!({}), None).await.unwrap();
    eventually(|| lobby.pool().get_link("gate", "9").is_some()).await;

    let second = PeerLink::connect_to(target, LinkEnv::new(me));
    second.push("echo", json!({}), None).await.unwrap();
    eventually(|| second.is_closed()).await;

    assert!(!first.is_closed());
    let reply = first.request("echo", json!("still here"), None).await.unwrap();
    assert_eq!(reply, json!("still here"));

    let err = second.request("echo", json!({}), None).await.unwrap_err();
    assert!(matches!(err, MeshError::SocketClosed));

    first.close(true, None).await;
    lobby.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peer_departure_reaches_storage() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::open_at(&dir.path().join("servers.db")).unwrap();
    let client = Arc::new(TestClient {
        id: "c1".into(),
        ..Default::default()
    });

    let edge = TestEdge {
        clients: HashMap::from([("c1".to_string(), client)]),
    };
    let gate = Mesh::builder(gate())
        .storage(storage.clone())
        .edge(Arc::new(edge))
        .build()
        .await
        .unwrap();
    let lobby = Mesh::builder(lobby())
        .storage(storage.clone())
        .handler(lobby_handlers())
        .build()
        .await
        .unwrap();
    assert!(lobby.registry().has_server("gate", "1"));
    assert_eq!(
        storage.status("gate", "1").await.unwrap(),
        Some(ServerStatus::Online)
    );

    gate.registry().sync(None).await.unwrap();
    let target = gate.registry().dispatch("lobby", None).unwrap();
    gate.pool().request(&target, "echo", json!(1), None).await.unwrap();
    eventually(|| lobby.pool().get_link("gate", "1").is_some()).await;

    gate.shutdown().await.unwrap();
    assert_eq!(
        storage.status("gate", "1").await.unwrap(),
        Some(ServerStatus::Dropped)
    );
    eventually(|| !lobby.registry().has_server("gate", "1")).await;
    // The lobby is still online: the gate's shutdown does not report it.
    assert_eq!(
        storage.status("lobby", "1").await.unwrap(),
        Some(ServerStatus::Online)
    );

    lobby.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_session_actions_need_an_edge() {
    let lobby = Mesh::builder(lobby())
        .storage(MemoryStorage::new())
        .build()
        .await
        .unwrap();
    let me = ServerDescriptor::new("2", "gate", "127.0.0.1").with_client_port(3011);
    let link = PeerLink::connect_to(lobby.local().clone(), LinkEnv::new(me));

    let err = link
        .request(native::SYNC_SESSION, json!({"cid": "c1"}), None)
        .await
        .unwrap_err();
    match err {
        MeshError::Remote { payload } => assert_eq!(payload["errCode"], "invalid_function"),
        other => panic!("unexpected error: {:?}", other),
    }

    link.close(true, None).await;
    lobby.shutdown().await.unwrap();
}

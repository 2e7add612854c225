#![allow(dead_code)]

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use live_chat::api::{build_router, AppState};
use live_chat::config::Config;
use live_chat::db::SqliteStore;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub state: AppState,
    handle: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TestUser {
    pub id: String,
    pub username: String,
    pub token: String,
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(Config::default()).await
}

/// Serve an in-memory store with `config`, bound to an ephemeral port.
pub async fn spawn_server_with(config: Config) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let config = Config {
        bind: addr.to_string(),
        ..config
    };
    let store = std::sync::Arc::new(SqliteStore::memory().unwrap());
    let state = AppState::with_store(config, store);
    let app = build_router(state.clone());
    let handle = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    TestServer {
        addr,
        client: reqwest::Client::new(),
        state,
        handle,
    }
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn signup(&self, username: &str) -> TestUser {
        let resp = self
            .client
            .post(self.url("/api/user/signup"))
            .json(&json!({
                "username": username,
                "email": format!("{}@example.com", username.to_lowercase()),
                "password": "password1"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let resp = self
            .client
            .post(self.url("/api/user/signin"))
            .json(&json!({"email": username, "password": "password1"}))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        let v: Value = resp.json().await.unwrap();
        TestUser {
            id: v["user"]["id"].as_str().unwrap().to_string(),
            username: username.to_string(),
            token: v["token"].as_str().unwrap().to_string(),
        }
    }

    /// Create a conversation as `owner`, returning the chat JSON.
    pub async fn create_chat(&self, owner: &TestUser, others: &[&TestUser], group: Option<&str>) -> Value {
        let resp = self
            .client
            .post(self.url("/api/chat/chats"))
            .bearer_auth(&owner.token)
            .json(&json!({
                "participants": others.iter().map(|u| u.id.clone()).collect::<Vec<_>>(),
                "isGroup": group.is_some(),
                "groupName": group,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    pub async fn ws(&self, token: &str) -> Ws {
        let mut req = format!("ws://{}/ws", self.addr).into_client_request().unwrap();
        req.headers_mut()
            .append("Authorization", format!("Bearer {}", token).parse().unwrap());
        let (ws, _) = connect_async(req).await.unwrap();
        ws
    }

    pub async fn ws_query(&self, token: &str) -> Ws {
        let (ws, _) = connect_async(format!("ws://{}/ws?token={}", self.addr, token))
            .await
            .unwrap();
        ws
    }
}

pub async fn send(ws: &mut Ws, event: Value) {
    ws.send(WsMessage::Text(event.to_string())).await.unwrap();
}

/// Next text event, skipping control frames. Panics after five seconds.
pub async fn next_event(ws: &mut Ws) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(WsMessage::Close(_))) | None => panic!("socket closed"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Assert that no text event arrives within a short window.
pub async fn assert_quiet(ws: &mut Ws) {
    let res = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return text,
                Some(Ok(_)) => continue,
                _ => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(text) = res {
        panic!("unexpected event {}", text);
    }
}

/// Send `join-chats` and return the joined ids.
pub async fn join(ws: &mut Ws) -> Vec<String> {
    send(ws, json!({"event": "join-chats"})).await;
    let ev = next_event(ws).await;
    assert_eq!(ev["event"], "chats-joined");
    ev["data"]["chatIds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

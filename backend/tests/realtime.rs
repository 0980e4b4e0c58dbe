use futures::StreamExt;
use murmur_backend::api::{build_router, AppState};
use murmur_backend::config::Config;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        public_url: format!("http://{}", addr),
        logging_enabled: false,
    };
    let state = AppState::new(&config).await.unwrap();
    let app = build_router(state);
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, tmp)
}

async fn sign_up(client: &reqwest::Client, addr: SocketAddr, name: &str) -> (String, String) {
    let v: Value = client
        .post(format!("http://{}/api/auth/signup", addr))
        .json(&json!({"email": format!("{name}@example.com"), "password": "hunter22", "username": name}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    (
        v["session"]["access_token"].as_str().unwrap().to_string(),
        v["user"]["id"].as_str().unwrap().to_string(),
    )
}

async fn open_channel(
    addr: SocketAddr,
    token: &str,
    query: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut req = format!("ws://{}/realtime?{}", addr, query)
        .into_client_request()
        .unwrap();
    req.headers_mut()
        .append("Authorization", format!("Bearer {}", token).parse().unwrap());
    let (mut ws, _) = connect_async(req).await.unwrap();
    let hello = ws.next().await.unwrap().unwrap();
    assert_eq!(hello, WsMessage::Text("subscribed".into()));
    ws
}

#[tokio::test]
async fn message_inserts_reach_participants_only() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, _) = sign_up(&client, addr, "alice").await;
    let (bob, bob_id) = sign_up(&client, addr, "bob").await;
    let (carol, _) = sign_up(&client, addr, "carol").await;

    let mut bob_ws = open_channel(addr, &bob, "table=messages&events=insert").await;
    let mut carol_ws = open_channel(addr, &carol, "table=messages").await;

    let opened: Value = client
        .post(format!("http://{}/api/conversations", addr))
        .bearer_auth(&alice)
        .json(&json!({"user_id": bob_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conv = opened["conversation"]["id"].as_str().unwrap().to_string();
    client
        .post(format!("http://{}/api/conversations/{}/messages", addr, conv))
        .bearer_auth(&alice)
        .json(&json!({"content": "psst"}))
        .send()
        .await
        .unwrap();

    let ev = timeout(Duration::from_secs(2), bob_ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_text()
        .unwrap();
    let v: Value = serde_json::from_str(&ev).unwrap();
    assert_eq!(v["table"], "messages");
    assert_eq!(v["kind"], "insert");
    assert_eq!(v["record"]["content"], "psst");
    assert_eq!(v["record"]["conversation_id"], conv.as_str());

    assert!(timeout(Duration::from_millis(300), carol_ws.next())
        .await
        .is_err());
    server.abort();
}

#[tokio::test]
async fn filtered_channel_and_bad_scopes() {
    let (addr, server, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let (alice, _) = sign_up(&client, addr, "alice").await;
    let (_bob, bob_id) = sign_up(&client, addr, "bob").await;
    let (_carol, carol_id) = sign_up(&client, addr, "carol").await;

    let mut ids = Vec::new();
    for other in [&bob_id, &carol_id] {
        let opened: Value = client
            .post(format!("http://{}/api/conversations", addr))
            .bearer_auth(&alice)
            .json(&json!({"user_id": other}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        ids.push(opened["conversation"]["id"].as_str().unwrap().to_string());
    }
    let mut ws = open_channel(
        addr,
        &alice,
        &format!("table=messages&events=insert&filter=conversation_id%3Deq.{}", ids[1]),
    )
    .await;
    for (conv, text) in [(&ids[0], "to bob"), (&ids[1], "to carol")] {
        client
            .post(format!("http://{}/api/conversations/{}/messages", addr, conv))
            .bearer_auth(&alice)
            .json(&json!({"content": text}))
            .send()
            .await
            .unwrap();
    }
    let ev = timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .into_text()
        .unwrap();
    let v: Value = serde_json::from_str(&ev).unwrap();
    assert_eq!(v["record"]["content"], "to carol");

    let mut req = format!("ws://{}/realtime?table=nope", addr)
        .into_client_request()
        .unwrap();
    req.headers_mut()
        .append("Authorization", format!("Bearer {}", alice).parse().unwrap());
    assert!(connect_async(req).await.is_err());

    let req = format!("ws://{}/realtime?table=messages", addr)
        .into_client_request()
        .unwrap();
    assert!(connect_async(req).await.is_err());
    server.abort();
}

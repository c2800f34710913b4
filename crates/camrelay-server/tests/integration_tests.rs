//! Integration tests for the camrelay server
//!
//! Each test starts the real router on an ephemeral port, backed by the
//! in-memory loopback engine, and talks to it over HTTP.
//!
//! Run with: cargo test -p camrelay-server --test integration_tests

use camrelay_protocol::{
    ChannelSummary, ErrorBody, ForceUnlockResponse, HealthResponse, IceServersResponse,
    QueryStateResponse, SdpType, SessionDescription, ViewerCountResponse,
};
use camrelay_server::rtc::{LoopbackEngine, PeerConnection};
use camrelay_server::rtc::loopback::{LoopbackConnection, LoopbackSource};
use camrelay_server::state::Config;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Test helper to start a test server
async fn start_test_server() -> TestServer {
    TestServer::start().await.expect("Failed to start test server")
}

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    engine: Arc<LoopbackEngine>,
    client: Client,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            stun_servers: vec!["stun:stun.example.com:3478".to_string()],
            turn_urls: vec!["turn:turn.example.com:3478?transport=udp".to_string()],
            turn_username: Some("camera".to_string()),
            turn_credential: Some("secret".to_string()),
            ..Config::default()
        };

        let engine = Arc::new(LoopbackEngine::new());
        let (router, _state) = camrelay_server::create_app_with_engine(config, engine.clone());

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(50)).await;

        Ok(Self {
            addr,
            engine,
            client: Client::new(),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn publish(&self, channel_id: &str) -> reqwest::Response {
        self.client
            .post(self.url("/publish"))
            .json(&json!({ "channel_id": channel_id, "sdp": "v=0\r\n", "type": "offer" }))
            .send()
            .await
            .expect("publish request failed")
    }

    async fn view(&self, channel_id: &str) -> reqwest::Response {
        self.client
            .post(self.url("/viewer"))
            .json(&json!({ "channel_id": channel_id, "sdp": "v=0\r\n", "type": "offer" }))
            .send()
            .await
            .expect("viewer request failed")
    }

    /// Publish and have the publisher's video arrive
    async fn publish_live(&self, channel_id: &str) -> Arc<LoopbackConnection> {
        let response = self.publish(channel_id).await;
        assert_eq!(response.status(), StatusCode::OK);

        let publisher = self.engine.last_connection().expect("no publisher connection");
        publisher
            .deliver_media(LoopbackSource::new(format!("{channel_id}-video")))
            .await;
        publisher
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> T {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request failed")
            .json()
            .await
            .expect("invalid response body")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[tokio::test]
async fn test_health() {
    let server = start_test_server().await;

    let health: HealthResponse = server.get("/health").await;
    assert_eq!(health.status, "ok");
}

#[tokio::test]
async fn test_publish_returns_answer() {
    let server = start_test_server().await;

    let response = server.publish("cam01").await;
    assert_eq!(response.status(), StatusCode::OK);

    let answer: SessionDescription = response.json().await.unwrap();
    assert_eq!(answer.sdp_type, SdpType::Answer);
    assert!(!answer.sdp.is_empty());
}

#[tokio::test]
async fn test_viewer_without_publisher_is_unavailable() {
    let server = start_test_server().await;

    let response = server.view("camX").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.code, "no_such_publisher");
}

#[tokio::test]
async fn test_one_viewer_per_channel() {
    let server = start_test_server().await;
    server.publish_live("cam01").await;

    let first = server.view("cam01").await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = server.view("cam01").await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body: ErrorBody = second.json().await.unwrap();
    assert_eq!(body.code, "viewer_slot_taken");

    let count: ViewerCountResponse = server.get("/viewers_count").await;
    assert_eq!(count.count, 1);
}

#[tokio::test]
async fn test_unlock_lets_next_viewer_in() {
    let server = start_test_server().await;
    server.publish_live("cam01").await;

    assert_eq!(server.view("cam01").await.status(), StatusCode::OK);
    let viewer = server.engine.last_connection().unwrap();

    let response = server
        .client
        .post(server.url("/channels/cam01/unlock"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let unlock: ForceUnlockResponse = response.json().await.unwrap();
    assert!(unlock.ok);
    assert_eq!(unlock.released_viewer, Some(viewer.id()));
    assert!(viewer.is_closed());

    assert_eq!(server.view("cam01").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unlock_unknown_channel() {
    let server = start_test_server().await;

    let response = server
        .client
        .post(server.url("/channels/nope/unlock"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_legacy_field_names() {
    let server = start_test_server().await;

    let response = server
        .client
        .post(server.url("/publish"))
        .json(&json!({ "publisher_id": "cam01", "sdp": "v=0\r\n", "type": "offer" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    server
        .engine
        .last_connection()
        .unwrap()
        .deliver_media(LoopbackSource::new("cam01-video"))
        .await;

    let response = server
        .client
        .post(server.url("/viewer"))
        .json(&json!({ "target": "cam01", "sdp": "v=0\r\n", "type": "offer" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rejects_empty_channel_and_answer_sdp() {
    let server = start_test_server().await;

    let response = server.publish("").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server
        .client
        .post(server.url("/publish"))
        .json(&json!({ "channel_id": "cam01", "sdp": "v=0\r\n", "type": "answer" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.code, "negotiation_error");
}

#[tokio::test]
async fn test_query_state_and_channels() {
    let server = start_test_server().await;
    server.publish_live("cam01").await;
    assert_eq!(server.view("cam01").await.status(), StatusCode::OK);

    let state: QueryStateResponse = server.get("/viewers").await;
    assert_eq!(state.viewer_count, 1);
    assert!(state.viewers[0].bound);
    assert_eq!(state.viewers[0].channel_id.as_deref(), Some("cam01"));

    let channels: Vec<ChannelSummary> = server.get("/channels").await;
    assert_eq!(channels.len(), 1);
    assert!(channels[0].has_media);
    assert_eq!(channels[0].viewer_id, Some(state.viewers[0].id));
}

#[tokio::test]
async fn test_publisher_loss_frees_channel() {
    let server = start_test_server().await;
    let publisher = server.publish_live("cam01").await;
    assert_eq!(server.view("cam01").await.status(), StatusCode::OK);
    let viewer = server.engine.last_connection().unwrap();

    publisher
        .set_state(camrelay_protocol::ConnectionState::Failed)
        .await;

    assert!(viewer.is_closed());
    let channels: Vec<ChannelSummary> = server.get("/channels").await;
    assert!(channels.is_empty());
    assert_eq!(server.view("cam01").await.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_ice_servers() {
    let server = start_test_server().await;

    let response: IceServersResponse = server.get("/rtc/ice-servers").await;
    assert_eq!(response.ice_servers.len(), 2);
    assert_eq!(response.ice_servers[0].urls, vec!["stun:stun.example.com:3478"]);
    assert_eq!(response.ice_servers[1].username.as_deref(), Some("camera"));
}

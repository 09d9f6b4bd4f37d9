//! Integration tests for the Moshimoshi server
//!
//! Boots the full app on an ephemeral port with the in-memory directory and
//! drives it over HTTP and WebSocket.
//!
//! Run with: cargo test -p moshimoshi-server --test integration_tests

use futures_util::{SinkExt, StreamExt};
use moshimoshi_protocol::{
    ClientMessage, ErrorCode, ErrorPayload, MediaKind, Request, ResponseBody, RtpCodecParameters,
    RtpParameters, ServerMessage, TransportDirection,
};
use moshimoshi_server::auth::create_token;
use moshimoshi_server::state::Config;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

const SECRET: &str = "test-secret-key-for-testing-only";

/// Test helper to start a test server
async fn start_test_server() -> TestServer {
    TestServer::start().await.expect("Failed to start test server")
}

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: None,
            jwt_secret: SECRET.to_string(),
            cors_origin: None,
            announced_ip: "127.0.0.1".to_string(),
            use_memory_directory: true,
        };

        let (router, _state) = moshimoshi_server::create_app(config).await?;

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
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A user with a signed token
struct TestUser {
    id: Uuid,
    token: String,
}

impl TestUser {
    fn new(name: &str) -> Self {
        let id = Uuid::new_v4();
        let token = create_token(id, name, SECRET, chrono::Duration::hours(1)).unwrap();
        Self { id, token }
    }
}

async fn create_meeting(client: &Client, server: &TestServer, owner: &TestUser, name: &str) -> Uuid {
    let response = client
        .post(format!("{}/api/meetings", server.http_url()))
        .bearer_auth(&owner.token)
        .json(&json!({ "name": name }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let meeting: serde_json::Value = response.json().await.unwrap();
    Uuid::parse_str(meeting["id"].as_str().unwrap()).unwrap()
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client that keeps pushes apart from responses
struct WsClient {
    stream: WsStream,
    next_id: u64,
    pushes: VecDeque<ServerMessage>,
}

impl WsClient {
    async fn connect(server: &TestServer, user: &TestUser) -> Self {
        let (stream, _) = connect_async(server.ws_url()).await.unwrap();
        let mut client = Self {
            stream,
            next_id: 1,
            pushes: VecDeque::new(),
        };

        client
            .send(&ClientMessage::Authenticate {
                token: user.token.clone(),
            })
            .await;
        match client.recv().await {
            Some(ServerMessage::Authenticated { user_id, .. }) => assert_eq!(user_id, user.id),
            other => panic!("Expected Authenticated, got {:?}", other),
        }
        client
    }

    async fn send(&mut self, message: &ClientMessage) {
        let json = serde_json::to_string(message).unwrap();
        self.stream.send(Message::Text(json.into())).await.unwrap();
    }

    /// Next server message, or `None` once the socket is closed
    async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            let frame = timeout(Duration::from_secs(5), self.stream.next())
                .await
                .expect("Timed out waiting for server message");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(text.as_str()).unwrap()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn request(&mut self, request: Request) -> ResponseBody {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&ClientMessage::Request { id, request }).await;

        loop {
            match self.recv().await {
                Some(ServerMessage::Response { id: got, body }) if got == id => return body,
                Some(push) => self.pushes.push_back(push),
                None => panic!("Socket closed while waiting for response {}", id),
            }
        }
    }

    /// First push matching `want`, skipping others
    async fn expect_push(&mut self, want: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        if let Some(pos) = self.pushes.iter().position(&want) {
            return self.pushes.remove(pos).unwrap();
        }
        loop {
            match self.recv().await {
                Some(message) if want(&message) => return message,
                Some(_) => continue,
                None => panic!("Socket closed while waiting for push"),
            }
        }
    }

    /// Whether a matching push arrives within `wait`
    async fn saw_push(&mut self, wait: Duration, want: impl Fn(&ServerMessage) -> bool) -> bool {
        if self.pushes.iter().any(&want) {
            return true;
        }
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(frame) = tokio::time::timeout_at(deadline, self.stream.next()).await {
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let message: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
                    if want(&message) {
                        return true;
                    }
                }
                Some(Ok(_)) => continue,
                _ => return false,
            }
        }
        false
    }

    async fn attend(&mut self, meeting_id: Uuid) -> bool {
        match self.request(Request::Attend { meeting_id }).await {
            ResponseBody::Attended { already, .. } => already,
            other => panic!("Expected Attended, got {:?}", other),
        }
    }

    async fn start_producing(&mut self, meeting_id: Uuid) -> String {
        let transport_id = match self
            .request(Request::CreateTransport {
                direction: TransportDirection::Send,
            })
            .await
        {
            ResponseBody::TransportCreated(params) => params.id,
            other => panic!("Expected TransportCreated, got {:?}", other),
        };

        match self
            .request(Request::Produce {
                meeting_id,
                transport_id,
                kind: MediaKind::Video,
                rtp_parameters: vp8(),
            })
            .await
        {
            ResponseBody::Produced { producer_id } => producer_id,
            other => panic!("Expected Produced, got {:?}", other),
        }
    }

    async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

fn vp8() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 101,
            clock_rate: 90000,
            channels: None,
            parameters: Default::default(),
            rtcp_feedback: vec![],
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_health_check() {
    let server = start_test_server().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/health", server.http_url()))
        .send()
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_meeting_lifecycle_over_http() {
    let server = start_test_server().await;
    let client = Client::new();
    let alice = TestUser::new("alice");
    let bob = TestUser::new("bob");

    let meeting_id = create_meeting(&client, &server, &alice, "Standup").await;
    let attend_url = format!("{}/api/meetings/{}/attend", server.http_url(), meeting_id);

    let first: serde_json::Value = client
        .post(&attend_url)
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["already"], false);
    assert_eq!(first["is_owner"], false);

    let second: serde_json::Value = client
        .post(&attend_url)
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["already"], true);
    assert_eq!(second["message"], "Already attended");

    let meetings: serde_json::Value = client
        .get(format!("{}/api/meetings", server.http_url()))
        .bearer_auth(&bob.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let participants = meetings[0]["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[0]["user_id"], alice.id.to_string());
    assert_eq!(participants[0]["is_owner"], true);

    let left: serde_json::Value = client
        .post(format!("{}/api/meetings/{}/leave", server.http_url(), meeting_id))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(left["success"], true);
    assert_eq!(left["meeting_finished"], true);

    let late = client
        .post(&attend_url)
        .bearer_auth(&TestUser::new("carol").token)
        .send()
        .await
        .unwrap();
    assert_eq!(late.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_websocket_rejects_bad_token() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();

    let auth = serde_json::to_string(&ClientMessage::Authenticate {
        token: "not-a-token".to_string(),
    })
    .unwrap();
    ws.send(Message::Text(auth.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    match reply {
        Some(Ok(Message::Text(text))) => {
            let message: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
            assert!(matches!(
                message,
                ServerMessage::Error(ErrorPayload { code: ErrorCode::Unauthenticated, .. })
            ));
        }
        other => panic!("Expected error frame, got {:?}", other),
    }

    // Nothing but the close follows
    let next = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
}

#[tokio::test]
async fn test_websocket_requires_authentication_first() {
    let server = start_test_server().await;
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();

    let ping = serde_json::to_string(&ClientMessage::Ping).unwrap();
    ws.send(Message::Text(ping.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(5), ws.next()).await.unwrap();
    match reply {
        Some(Ok(Message::Text(text))) => {
            let message: ServerMessage = serde_json::from_str(text.as_str()).unwrap();
            assert!(matches!(
                message,
                ServerMessage::Error(ErrorPayload { code: ErrorCode::Unauthenticated, .. })
            ));
        }
        other => panic!("Expected error frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let server = start_test_server().await;
    let mut alice = WsClient::connect(&server, &TestUser::new("alice")).await;

    alice.send(&ClientMessage::Ping).await;
    assert!(matches!(alice.recv().await, Some(ServerMessage::Pong)));
}

#[tokio::test]
async fn test_bad_frame_after_auth_keeps_connection() {
    let server = start_test_server().await;
    let mut alice = WsClient::connect(&server, &TestUser::new("alice")).await;

    alice
        .stream
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    match alice.recv().await {
        Some(ServerMessage::Error(payload)) => assert_eq!(payload.code, ErrorCode::BadRequest),
        other => panic!("Expected error frame, got {:?}", other),
    }

    alice.send(&ClientMessage::Ping).await;
    assert!(matches!(alice.recv().await, Some(ServerMessage::Pong)));
}

#[tokio::test]
async fn test_new_producer_stays_in_its_meeting() {
    let server = start_test_server().await;
    let client = Client::new();
    let alice = TestUser::new("alice");
    let bob = TestUser::new("bob");
    let carol = TestUser::new("carol");

    let standup = create_meeting(&client, &server, &alice, "Standup").await;
    let retro = create_meeting(&client, &server, &carol, "Retro").await;

    let mut alice_ws = WsClient::connect(&server, &alice).await;
    let mut bob_ws = WsClient::connect(&server, &bob).await;
    let mut carol_ws = WsClient::connect(&server, &carol).await;
    assert!(alice_ws.attend(standup).await);
    assert!(!bob_ws.attend(standup).await);
    assert!(carol_ws.attend(retro).await);

    let producer_id = alice_ws.start_producing(standup).await;

    let push = bob_ws
        .expect_push(|m| matches!(m, ServerMessage::NewProducer { .. }))
        .await;
    match push {
        ServerMessage::NewProducer {
            meeting_id,
            participant,
        } => {
            assert_eq!(meeting_id, standup);
            assert_eq!(participant.user_id, alice.id);
            assert_eq!(participant.producer_id.as_deref(), Some(producer_id.as_str()));
        }
        other => panic!("Expected NewProducer, got {:?}", other),
    }

    let recv_transport = match bob_ws
        .request(Request::CreateTransport {
            direction: TransportDirection::Recv,
        })
        .await
    {
        ResponseBody::TransportCreated(params) => params.id,
        other => panic!("Expected TransportCreated, got {:?}", other),
    };
    match bob_ws
        .request(Request::Consume {
            transport_id: recv_transport,
            producer_id: producer_id.clone(),
            rtp_capabilities: None,
        })
        .await
    {
        ResponseBody::ConsumerCreated(consumer) => {
            assert_eq!(consumer.producer_id, producer_id);
            assert_eq!(consumer.kind, MediaKind::Video);
        }
        other => panic!("Expected ConsumerCreated, got {:?}", other),
    }

    assert!(
        !carol_ws
            .saw_push(Duration::from_millis(300), |m| matches!(
                m,
                ServerMessage::NewProducer { .. }
            ))
            .await
    );
}

#[tokio::test]
async fn test_errors_come_back_as_responses() {
    let server = start_test_server().await;
    let mut alice = WsClient::connect(&server, &TestUser::new("alice")).await;

    match alice
        .request(Request::Produce {
            meeting_id: Uuid::new_v4(),
            transport_id: "missing".to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: vp8(),
        })
        .await
    {
        ResponseBody::Error(payload) => assert_eq!(payload.code, ErrorCode::NotFound),
        other => panic!("Expected Error, got {:?}", other),
    }

    match alice
        .request(Request::GetParticipants {
            meeting_id: Uuid::new_v4(),
        })
        .await
    {
        ResponseBody::Error(payload) => assert_eq!(payload.code, ErrorCode::NotFound),
        other => panic!("Expected Error, got {:?}", other),
    }

    // The connection survives failed requests
    assert!(matches!(
        alice.request(Request::GetCapabilities).await,
        ResponseBody::Capabilities { .. }
    ));
}

#[tokio::test]
async fn test_disconnect_cleans_up_participant() {
    let server = start_test_server().await;
    let client = Client::new();
    let alice = TestUser::new("alice");
    let bob = TestUser::new("bob");

    let meeting_id = create_meeting(&client, &server, &alice, "Standup").await;
    let mut alice_ws = WsClient::connect(&server, &alice).await;
    let mut bob_ws = WsClient::connect(&server, &bob).await;
    alice_ws.attend(meeting_id).await;
    bob_ws.attend(meeting_id).await;
    let producer_id = alice_ws.start_producing(meeting_id).await;

    match bob_ws.request(Request::GetParticipants { meeting_id }).await {
        ResponseBody::Participants { participants } => {
            assert_eq!(participants.len(), 2);
            assert_eq!(participants[0].user_id, alice.id);
            assert_eq!(participants[0].producer_id.as_deref(), Some(producer_id.as_str()));
        }
        other => panic!("Expected Participants, got {:?}", other),
    }

    bob_ws.close().await;

    let bob_id = bob.id;
    alice_ws
        .expect_push(move |m| {
            matches!(m, ServerMessage::ParticipantLeft { user_id, .. } if *user_id == bob_id)
        })
        .await;

    let participants: serde_json::Value = client
        .get(format!(
            "{}/api/meetings/{}/participants",
            server.http_url(),
            meeting_id
        ))
        .bearer_auth(&alice.token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let participants = participants.as_array().unwrap();
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0]["user_id"], alice.id.to_string());
}

#[tokio::test]
async fn test_owner_leave_finishes_meeting_for_everyone() {
    let server = start_test_server().await;
    let client = Client::new();
    let alice = TestUser::new("alice");
    let bob = TestUser::new("bob");

    let meeting_id = create_meeting(&client, &server, &alice, "Standup").await;
    let mut alice_ws = WsClient::connect(&server, &alice).await;
    let mut bob_ws = WsClient::connect(&server, &bob).await;
    alice_ws.attend(meeting_id).await;
    bob_ws.attend(meeting_id).await;

    match alice_ws.request(Request::Leave { meeting_id }).await {
        ResponseBody::Left { success, .. } => assert!(success),
        other => panic!("Expected Left, got {:?}", other),
    }

    bob_ws
        .expect_push(|m| matches!(m, ServerMessage::MeetingFinished { .. }))
        .await;

    let mut carol_ws = WsClient::connect(&server, &TestUser::new("carol")).await;
    match carol_ws.request(Request::Attend { meeting_id }).await {
        ResponseBody::Error(payload) => assert_eq!(payload.code, ErrorCode::NotFound),
        other => panic!("Expected Error, got {:?}", other),
    }
}

//! Integration tests for whole bridge sessions
//!
//! Every test drives a real [`Bridge`] through the in-process transport, the
//! way an avatar client would over WebSocket. Tests cover:
//! - Handshake, chat input and the performance that answers it
//! - Authentication failure and capacity refusal
//! - Resource registration limits and rid lifetime
//! - Attachment warnings and outbound reference acknowledgement
//! - Two-phase uploads with `res.prepare` and `res.commit`
//! - Keep-alive pings and idle closure

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;

use bridge_core::protocol::into_payload;
use bridge_core::{
    channel_pair, BackendReply, Bridge, BridgeConfig, ChatBackend, EchoBackend, InProcessClient,
    MediaSource, NormalizedChatEvent, Packet, ResourceError, ResourceKind, ResourceSource, Rid,
    SessionState,
};
use bridge_core::session::{AuthToken, CloseReason, SessionConfig};

const TOKEN: &str = "abc123";

// =============================================================================
// Helpers
// =============================================================================

/// Backend that records events and answers with a fixed reply
#[derive(Default)]
struct ScriptedBackend {
    events: Mutex<Vec<NormalizedChatEvent>>,
    reply: Option<BackendReply>,
}

impl ScriptedBackend {
    fn replying(reply: BackendReply) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            reply: Some(reply),
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn handle_event(
        &self,
        event: &NormalizedChatEvent,
    ) -> anyhow::Result<Option<BackendReply>> {
        self.events.lock().push(event.clone());
        Ok(self.reply.clone())
    }
}

fn bridge_with(dir: &TempDir, max_sessions: usize, backend: Arc<dyn ChatBackend>) -> Bridge {
    let mut config = BridgeConfig::for_testing(dir.path());
    config.server.max_sessions = max_sessions;
    Bridge::new(&config, AuthToken::new(TOKEN).unwrap(), backend)
}

fn packet(op: &str, id: &str, payload: Value) -> Packet {
    Packet::new(op, id).with_payload(into_payload(payload))
}

async fn recv(client: &mut InProcessClient) -> Option<Packet> {
    tokio::time::timeout(Duration::from_secs(5), client.recv_packet())
        .await
        .expect("timed out waiting for a packet")
}

/// Receive, skipping keep-alive pings
async fn recv_op(client: &mut InProcessClient, op: &str) -> Packet {
    loop {
        let packet = recv(client).await.expect("connection closed");
        if packet.op == op {
            return packet;
        }
        assert_eq!(packet.op, "sys.ping", "unexpected packet {packet:?}");
    }
}

async fn connect(bridge: &Bridge) -> InProcessClient {
    let (transport, client) = channel_pair(32, "it");
    let _task = bridge.accept(Box::new(transport)).await.unwrap();
    client
}

async fn connect_ready(bridge: &Bridge, motions: &[&str]) -> (InProcessClient, Packet) {
    let mut client = connect(bridge).await;
    client
        .send_packet(&packet(
            "sys.handshake",
            "hs",
            json!({"token": TOKEN, "version": "1.0", "model": "hiyori", "motions": motions}),
        ))
        .await
        .unwrap();
    let ack = recv_op(&mut client, "sys.handshake").await;
    (client, ack)
}

fn sequence(perform: &Packet) -> Vec<Value> {
    perform.payload.as_ref().unwrap()["sequence"]
        .as_array()
        .unwrap()
        .clone()
}

fn error_code(packet: &Packet) -> u32 {
    packet.error.as_ref().expect("not an error packet").code
}

// =============================================================================
// Handshake and chat
// =============================================================================

#[tokio::test]
async fn test_handshake_then_chat_reaches_backend() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    let bridge = bridge_with(&dir, 1, backend.clone());

    let (mut client, ack) = connect_ready(&bridge, &[]).await;
    let ack = ack.payload.unwrap();
    let client_id = ack["clientId"].as_str().unwrap().to_string();
    assert!(!client_id.is_empty());
    assert_eq!(ack["sessionId"], format!("session-{client_id}"));
    assert!(ack["capabilities"].as_array().is_some_and(|c| !c.is_empty()));
    assert_eq!(bridge.manager().handles()[0].state(), SessionState::Ready);

    client
        .send(br#"{"op":"chat.input","id":"1","ts":1000,"payload":{"text":"hello"}}"#.to_vec())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.events.lock().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let events = backend.events.lock().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].content, "hello");
    assert!(events[0].attachments.is_empty());
    assert_eq!(events[0].message_id, "1");
    assert_eq!(events[0].client_id.as_str(), client_id);
}

#[tokio::test]
async fn test_echo_round_trip_is_correlated() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet("chat.input", "42", json!({"text": "hello"})))
        .await
        .unwrap();

    let perform = recv_op(&mut client, "chat.perform").await;
    assert_eq!(perform.payload.as_ref().unwrap()["replyTo"], "42");
    let cues = sequence(&perform);
    let texts: Vec<&Value> = cues
        .iter()
        .filter(|c| c["kind"] == "text")
        .map(|c| &c["payload"]["text"])
        .collect();
    assert_eq!(texts, vec![&json!("Received: hello")]);
}

#[tokio::test]
async fn test_happy_reply_opens_with_expression() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::replying(BackendReply::text(
        "I'm happy to help!",
    )));
    let bridge = bridge_with(&dir, 1, backend);
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet("chat.input", "1", json!({"text": "can you help?"})))
        .await
        .unwrap();

    let cues = sequence(&recv_op(&mut client, "chat.perform").await);
    assert_eq!(cues[0]["kind"], "expression");
    assert_eq!(cues[0]["startOffset"], 0);
    assert_eq!(cues[0]["payload"]["name"], "happy");
    assert_eq!(cues[1]["kind"], "text");
}

#[tokio::test]
async fn test_cue_offsets_ordered_and_expressions_disjoint() {
    let dir = TempDir::new().unwrap();
    let reply = BackendReply::text(
        "Great news, I'm so happy! [bridge:motion TapBody] Sadly it rained. \
         Wow, what a surprise! Anyway, let's go.",
    )
    .with_motion("Idle");
    let bridge = bridge_with(&dir, 1, Arc::new(ScriptedBackend::replying(reply)));
    let (mut client, _) = connect_ready(&bridge, &["Idle"]).await;

    client
        .send_packet(&packet("chat.input", "1", json!({"text": "news?"})))
        .await
        .unwrap();
    let cues = sequence(&recv_op(&mut client, "chat.perform").await);

    let offsets: Vec<u64> = cues
        .iter()
        .map(|c| c["startOffset"].as_u64().unwrap())
        .collect();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "{offsets:?}");

    let spans: Vec<(u64, u64)> = cues
        .iter()
        .filter(|c| c["kind"] == "expression")
        .map(|c| {
            let start = c["startOffset"].as_u64().unwrap();
            (start, start + c["duration"].as_u64().unwrap_or(0))
        })
        .collect();
    assert!(!spans.is_empty());
    assert!(spans.windows(2).all(|w| w[0].1 <= w[1].0), "{spans:?}");

    // TapBody was requested by tag but never advertised
    assert!(cues
        .iter()
        .any(|c| c["kind"] == "motion" && c["payload"]["noop"] == true));
}

// =============================================================================
// Authentication and admission
// =============================================================================

#[tokio::test]
async fn test_wrong_token_never_reaches_ready() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (transport, mut client) = channel_pair(32, "it");
    let task = bridge.accept(Box::new(transport)).await.unwrap();

    client
        .send_packet(&packet("sys.auth", "a1", json!({"token": "wrong"})))
        .await
        .unwrap();
    let reply = recv(&mut client).await.unwrap();
    assert_eq!(error_code(&reply), 4001);
    assert_eq!(reply.id, "a1");

    // A retry on the same connection goes nowhere
    let _ = client
        .send_packet(&packet("sys.auth", "a2", json!({"token": TOKEN})))
        .await;
    assert!(recv(&mut client).await.is_none());

    let outcome = task.await.unwrap();
    assert_eq!(outcome.state, SessionState::Failed);
    assert_eq!(bridge.manager().count(), 0);
}

#[tokio::test]
async fn test_capacity_ceiling_refuses_second_connection() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (mut first, _) = connect_ready(&bridge, &[]).await;

    let (transport, mut second) = channel_pair(8, "second");
    let refused = bridge.accept(Box::new(transport)).await;
    assert!(refused.is_err());

    let refusal = recv(&mut second).await.unwrap();
    assert_eq!(refusal.op, "sys.error");
    assert_eq!(error_code(&refusal), 4290);
    assert!(recv(&mut second).await.is_none());

    // First connection is unaffected
    first
        .send_packet(&packet("sys.ping", "p1", json!({})))
        .await
        .unwrap();
    let pong = recv_op(&mut first, "sys.pong").await;
    assert_eq!(pong.id, "p1");
    assert_eq!(bridge.manager().count(), 1);
}

#[tokio::test]
async fn test_kick_old_evicts_oldest_session() {
    let dir = TempDir::new().unwrap();
    let mut config = BridgeConfig::for_testing(dir.path());
    config.server.kick_old = true;
    let bridge = Bridge::new(&config, AuthToken::new(TOKEN).unwrap(), Arc::new(EchoBackend));

    let (mut first, _) = connect_ready(&bridge, &[]).await;
    let (_second, _) = connect_ready(&bridge, &[]).await;

    let close = recv_op(&mut first, "sys.close").await;
    assert_eq!(close.payload.unwrap()["reason"], "kicked");
    assert_eq!(bridge.manager().count(), 1);
}

// =============================================================================
// Resources
// =============================================================================

#[tokio::test]
async fn test_oversized_registration_is_refused() {
    let dir = TempDir::new().unwrap();
    let mut config = BridgeConfig::for_testing(dir.path());
    config.resource.max_resource_bytes = 16;
    config.resource.max_inline_bytes = 16;
    let bridge = Bridge::new(&config, AuthToken::new(TOKEN).unwrap(), Arc::new(EchoBackend));

    let err = bridge
        .resources()
        .register(ResourceSource::Bytes(vec![0; 17]), ResourceKind::File, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ResourceError::TooLarge { size: 17, max: 16 }));
    assert!(bridge.resources().list().is_empty());

    // Same limit over the wire: 24 bytes of base64 zeros decode to 18 bytes
    let (mut client, _) = connect_ready(&bridge, &[]).await;
    client
        .send_packet(&packet(
            "res.register",
            "r1",
            json!({"kind": "file", "data": "AAAAAAAAAAAAAAAAAAAAAAAA"}),
        ))
        .await
        .unwrap();
    let reply = recv_op(&mut client, "sys.error").await;
    assert_eq!(reply.id, "r1");
    assert_eq!(error_code(&reply), 4130);
    assert!(bridge.resources().list().is_empty());
}

#[tokio::test]
async fn test_reclaimed_rid_is_never_reused() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let resources = bridge.resources();

    let first = resources
        .register(ResourceSource::Bytes(b"one".to_vec()), ResourceKind::File, None, None)
        .await
        .unwrap();
    resources.release(&first).unwrap();
    assert_eq!(resources.sweep().await.removed, 1);

    let second = resources
        .register(ResourceSource::Bytes(b"one".to_vec()), ResourceKind::File, None, None)
        .await
        .unwrap();
    assert_ne!(first, second);
    assert!(matches!(resources.resolve(&first), Err(ResourceError::NotFound(_))));
    assert!(resources.resolve(&second).is_ok());
}

#[tokio::test]
async fn test_register_get_release_over_the_wire() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet(
            "res.register",
            "r1",
            json!({"kind": "image", "mime": "image/png", "data": "iVBORw0KGgo="}),
        ))
        .await
        .unwrap();
    let registered = recv_op(&mut client, "res.register").await;
    let descriptor = &registered.payload.as_ref().unwrap()["resource"];
    let rid = descriptor["rid"].as_str().unwrap().to_string();
    assert_eq!(descriptor["mime"], "image/png");
    assert_eq!(descriptor["size"], 8);
    assert!(descriptor["url"].as_str().unwrap().ends_with(&format!("/resources/{rid}?token={TOKEN}")));

    client
        .send_packet(&packet("res.get", "g1", json!({"rid": rid})))
        .await
        .unwrap();
    let fetched = recv_op(&mut client, "res.get").await;
    assert_eq!(fetched.payload.unwrap()["resource"]["rid"], rid.as_str());

    client
        .send_packet(&packet("res.release", "x1", json!({"rid": rid})))
        .await
        .unwrap();
    let released = recv_op(&mut client, "res.release").await;
    assert_eq!(released.payload.unwrap()["released"], true);

    assert_eq!(bridge.sweep().await.removed, 1);
    client
        .send_packet(&packet("res.get", "g2", json!({"rid": rid})))
        .await
        .unwrap();
    let gone = recv_op(&mut client, "sys.error").await;
    assert_eq!(gone.id, "g2");
    assert_eq!(error_code(&gone), 4040);
}

#[tokio::test]
async fn test_voice_reference_pinned_until_ack() {
    let dir = TempDir::new().unwrap();
    let reply = BackendReply::text("Listen to this.").with_voice(
        MediaSource::Bytes {
            data: vec![1, 2, 3, 4],
            mime: "audio/wav".into(),
        },
        Some(1500),
    );
    let bridge = bridge_with(&dir, 1, Arc::new(ScriptedBackend::replying(reply)));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet("chat.input", "1", json!({"text": "sing"})))
        .await
        .unwrap();
    let cues = sequence(&recv_op(&mut client, "chat.perform").await);
    let voice = cues.iter().find(|c| c["kind"] == "voice").unwrap();
    assert_eq!(voice["duration"], 1500);
    let rid = Rid::from(voice["resourceRef"].as_str().unwrap());

    // Pinned for the session; a sweep leaves it alone
    assert_eq!(bridge.sweep().await.removed, 0);
    assert!(bridge.resources().resolve(&rid).is_ok());

    client
        .send_packet(&packet("res.ack", "k1", json!({"rid": rid.as_str()})))
        .await
        .unwrap();
    client
        .send_packet(&packet("sys.ping", "p1", json!({})))
        .await
        .unwrap();
    recv_op(&mut client, "sys.pong").await;

    assert_eq!(bridge.sweep().await.removed, 1);
    assert!(matches!(
        bridge.resources().resolve(&rid),
        Err(ResourceError::NotFound(_))
    ));
}

// =============================================================================
// Input warnings
// =============================================================================

#[tokio::test]
async fn test_unsupported_attachment_keeps_text() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    let bridge = bridge_with(&dir, 1, backend.clone());
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet(
            "chat.input",
            "m1",
            json!({"text": "look at this", "attachments": [{"type": "hologram", "data": "AAAA"}]}),
        ))
        .await
        .unwrap();

    let warning = recv_op(&mut client, "sys.error").await;
    assert_eq!(warning.id, "m1");
    assert_eq!(error_code(&warning), 4005);

    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.events.lock().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let event = backend.events.lock()[0].clone();
    assert_eq!(event.content, "look at this");
    assert!(event.attachments.is_empty());
}

#[tokio::test]
async fn test_status_query_reports_counts() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 3, Arc::new(EchoBackend));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet("status.query", "s1", json!({})))
        .await
        .unwrap();
    let status = recv_op(&mut client, "status.query").await.payload.unwrap();
    assert_eq!(status["sessions"], 1);
    assert_eq!(status["maxSessions"], 3);
    assert_eq!(status["resources"], 0);
    assert_eq!(status["state"], "ready");
}

// =============================================================================
// Two-phase uploads
// =============================================================================

#[tokio::test]
async fn test_prepare_commit_round_trip() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet(
            "res.prepare",
            "p1",
            json!({"kind": "image", "mime": "image/png", "size": 8}),
        ))
        .await
        .unwrap();
    let prepared = recv_op(&mut client, "res.prepare").await.payload.unwrap();
    let rid = prepared["rid"].as_str().unwrap().to_string();
    assert_eq!(prepared["upload"]["method"], "PUT");
    assert_eq!(
        prepared["upload"]["headers"]["Authorization"],
        format!("Bearer {TOKEN}")
    );
    assert_eq!(prepared["resource"]["status"], "pending");
    assert_eq!(prepared["resource"]["size"], 8);

    client
        .send_packet(&packet("res.progress", "pr1", json!({"rid": rid, "loaded": 4, "total": 8})))
        .await
        .unwrap();
    client
        .send_packet(&packet("res.commit", "c1", json!({"rid": rid, "data": "iVBORw0KGgo="})))
        .await
        .unwrap();
    // progress has no answer, so the commit reply comes next
    let committed = recv_op(&mut client, "res.commit").await;
    assert_eq!(committed.id, "c1");
    let committed = committed.payload.unwrap();
    assert_eq!(committed["rid"], rid.as_str());
    assert_eq!(committed["status"], "ready");
    assert_eq!(committed["resource"]["size"], 8);
    assert!(committed["resource"]["inline"]
        .as_str()
        .unwrap()
        .starts_with("data:image/png;base64,"));

    client
        .send_packet(&packet("res.get", "g1", json!({"rid": rid})))
        .await
        .unwrap();
    let fetched = recv_op(&mut client, "res.get").await.payload.unwrap();
    assert_eq!(fetched["resource"]["status"], "ready");

    client
        .send_packet(&packet("res.commit", "c2", json!({"rid": rid})))
        .await
        .unwrap();
    let twice = recv_op(&mut client, "sys.error").await;
    assert_eq!(twice.id, "c2");
    assert_eq!(error_code(&twice), 4003);
}

#[tokio::test]
async fn test_commit_of_file_written_by_byte_server() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet("res.prepare", "p1", json!({"kind": "audio", "size": 1024})))
        .await
        .unwrap();
    let prepared = recv_op(&mut client, "res.prepare").await.payload.unwrap();
    let rid = Rid::from(prepared["rid"].as_str().unwrap());

    let path = bridge.resources().upload_path(&rid).unwrap();
    tokio::fs::write(&path, vec![1u8; 300]).await.unwrap();

    client
        .send_packet(&packet("res.commit", "c1", json!({"rid": rid.as_str()})))
        .await
        .unwrap();
    let committed = recv_op(&mut client, "res.commit").await.payload.unwrap();
    assert_eq!(committed["resource"]["size"], 300);
    assert_eq!(committed["resource"]["mime"], "audio/mpeg");
    assert_eq!(bridge.resources().read(&rid).await.unwrap().len(), 300);
}

#[tokio::test]
async fn test_commit_of_unknown_rid_is_not_found() {
    let dir = TempDir::new().unwrap();
    let bridge = bridge_with(&dir, 1, Arc::new(EchoBackend));
    let (mut client, _) = connect_ready(&bridge, &[]).await;

    client
        .send_packet(&packet("res.commit", "c1", json!({"rid": "res-nope-9", "data": "aGk="})))
        .await
        .unwrap();
    let err = recv_op(&mut client, "sys.error").await;
    assert_eq!(err.id, "c1");
    assert_eq!(error_code(&err), 4040);
    assert_eq!(bridge.manager().handles()[0].state(), SessionState::Ready);
}

// =============================================================================
// Keep-alive
// =============================================================================

fn keepalive_bridge(dir: &TempDir) -> Bridge {
    let mut config = BridgeConfig::for_testing(dir.path());
    config.session = SessionConfig {
        handshake_timeout: Duration::from_secs(5),
        ..SessionConfig::for_testing()
    };
    Bridge::new(&config, AuthToken::new(TOKEN).unwrap(), Arc::new(EchoBackend))
}

async fn handshake(client: &InProcessClient) {
    client
        .send_packet(&packet("sys.handshake", "hs", json!({"token": TOKEN})))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_silent_client_is_pinged_then_closed_idle() {
    let dir = TempDir::new().unwrap();
    let bridge = keepalive_bridge(&dir);
    let (transport, mut client) = channel_pair(32, "it");
    let task = bridge.accept(Box::new(transport)).await.unwrap();
    handshake(&client).await;
    assert_eq!(recv(&mut client).await.unwrap().op, "sys.handshake");

    let ping = recv(&mut client).await.unwrap();
    assert_eq!(ping.op, "sys.ping");

    let close = recv(&mut client).await.unwrap();
    assert_eq!(close.op, "sys.close");
    assert_eq!(close.payload.unwrap()["reason"], "idle");
    assert!(recv(&mut client).await.is_none());

    let outcome = task.await.unwrap();
    assert_eq!(outcome.state, SessionState::Closed);
    assert_eq!(outcome.reason, CloseReason::Idle);
    assert_eq!(bridge.manager().count(), 0);
}

#[tokio::test]
async fn test_client_traffic_defers_idle_close() {
    let dir = TempDir::new().unwrap();
    let bridge = keepalive_bridge(&dir);
    let (transport, mut client) = channel_pair(32, "it");
    let task = bridge.accept(Box::new(transport)).await.unwrap();
    handshake(&client).await;
    assert_eq!(recv(&mut client).await.unwrap().op, "sys.handshake");

    // twice the idle timeout, answered every 80ms
    for n in 0..8 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        client
            .send_packet(&Packet::new("sys.pong", format!("k{n}")))
            .await
            .unwrap();
    }
    assert_eq!(bridge.manager().handles()[0].state(), SessionState::Ready);

    loop {
        let packet = recv(&mut client).await.expect("closed without notice");
        if packet.op == "sys.close" {
            assert_eq!(packet.payload.unwrap()["reason"], "idle");
            break;
        }
        assert_eq!(packet.op, "sys.ping");
    }
    assert_eq!(task.await.unwrap().reason, CloseReason::Idle);
}

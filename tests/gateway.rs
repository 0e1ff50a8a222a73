use accord::error::Error;
use accord::gateway::{
    Connector, GatewaySession, GatewaySocket, Payload, SessionConfig, SocketEvent, Status,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Socket driven entirely by the test: incoming events are queued on a
/// channel, outgoing text frames are decoded and recorded.
struct ScriptedSocket {
    incoming: mpsc::UnboundedReceiver<SocketEvent>,
    sent: Arc<Mutex<Vec<Value>>>,
    closed: Arc<Mutex<Option<u16>>>,
    aborted: Arc<AtomicBool>,
}

impl GatewaySocket for ScriptedSocket {
    async fn recv(&mut self) -> accord::Result<Option<SocketEvent>> {
        Ok(self.incoming.recv().await)
    }

    async fn send_text(&mut self, text: String) -> accord::Result<()> {
        let value = serde_json::from_str(&text).expect("engine sends valid json");
        self.sent.lock().expect("lock").push(value);
        Ok(())
    }

    async fn send_binary(&mut self, _bytes: Vec<u8>) -> accord::Result<()> {
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> accord::Result<()> {
        *self.closed.lock().expect("lock") = Some(code);
        self.incoming.close();
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.incoming.close();
    }
}

/// Handle the test keeps after building one scripted socket.
struct SocketHandle {
    tx: mpsc::UnboundedSender<SocketEvent>,
    sent: Arc<Mutex<Vec<Value>>>,
    closed: Arc<Mutex<Option<u16>>>,
    aborted: Arc<AtomicBool>,
}

impl SocketHandle {
    fn feed(&self, frame: Value) {
        let _ = self.tx.send(SocketEvent::Message(Payload::Text(frame.to_string())));
    }

    fn feed_text(&self, text: &str) {
        let _ = self
            .tx
            .send(SocketEvent::Message(Payload::Text(text.to_owned())));
    }

    fn feed_close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(SocketEvent::Closed {
            code,
            reason: reason.to_owned(),
        });
    }

    fn sent_ops(&self) -> Vec<u64> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .filter_map(|v| v["op"].as_u64())
            .collect()
    }

    fn sent_with_op(&self, op: u64) -> Option<Value> {
        self.sent
            .lock()
            .expect("lock")
            .iter()
            .find(|v| v["op"].as_u64() == Some(op))
            .cloned()
    }

    fn close_code(&self) -> Option<u16> {
        *self.closed.lock().expect("lock")
    }

    fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

fn scripted_socket() -> (SocketHandle, ScriptedSocket) {
    let (tx, incoming) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let closed = Arc::new(Mutex::new(None));
    let aborted = Arc::new(AtomicBool::new(false));
    (
        SocketHandle {
            tx,
            sent: sent.clone(),
            closed: closed.clone(),
            aborted: aborted.clone(),
        },
        ScriptedSocket {
            incoming,
            sent,
            closed,
            aborted,
        },
    )
}

struct ScriptedConnector {
    sockets: Mutex<VecDeque<ScriptedSocket>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(sockets: Vec<ScriptedSocket>) -> (Self, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        (
            Self {
                sockets: Mutex::new(sockets.into()),
                connects: connects.clone(),
            },
            connects,
        )
    }
}

impl Connector for ScriptedConnector {
    type Socket = ScriptedSocket;

    async fn connect(&self, _url: &Url) -> accord::Result<ScriptedSocket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.sockets
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| {
                accord::error::TransportError::Other("no scripted sockets remain".to_owned()).into()
            })
    }
}

fn config() -> SessionConfig {
    SessionConfig {
        token: "tok".to_owned(),
        reconnect_backoff: Duration::from_millis(1),
        ..SessionConfig::default()
    }
}

fn hello(interval_ms: u64) -> Value {
    json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})
}

fn ready(session_id: &str, seq: u64) -> Value {
    json!({"op": 0, "t": "READY", "s": seq, "d": {"session_id": session_id}})
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn bootstrap_identifies_and_latches_session() {
    let (handle, socket) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    handle.feed(hello(45_000));
    eventually(|| handle.sent_with_op(2).is_some()).await;

    let identify = handle.sent_with_op(2).expect("identify sent");
    assert_eq!(identify["d"]["token"], "tok");
    assert_eq!(identify["d"]["shard"], json!([0, 1]));
    assert!(identify["d"]["properties"]["os"].is_string());
    assert!(handle.sent_with_op(6).is_none(), "no resume without a session");

    // The heartbeat loop starts at HELLO with an immediate beat.
    eventually(|| handle.sent_with_op(1).is_some()).await;

    handle.feed(ready("abc", 1));
    eventually(|| session.session().id.as_deref() == Some("abc")).await;
    assert_eq!(session.session().seq, Some(1));
    assert_eq!(session.status(), Status::Ready);

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn fatal_close_does_not_reconnect() {
    let (handle, socket) = scripted_socket();
    let (connector, connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    handle.feed(hello(45_000));
    handle.feed(ready("abc", 1));
    handle.feed_close(4004, "auth");

    let outcome = runner.await.expect("join");
    match outcome {
        Err(Error::Gateway(closed)) => {
            assert_eq!(closed.code, 4004);
            assert_eq!(closed.reason, "auth");
        }
        other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
    }

    assert_eq!(session.status(), Status::Closed);
    assert_eq!(connects.load(Ordering::SeqCst), 1, "no reconnect after 4004");
    assert!(session.send_packet(accord::gateway::Opcode::Heartbeat, Value::Null).is_err());
}

#[tokio::test]
async fn session_timeout_close_reidentifies() {
    let (first, socket_a) = scripted_socket();
    let (second, socket_b) = scripted_socket();
    let (connector, connects) = ScriptedConnector::new(vec![socket_a, socket_b]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    first.feed(hello(45_000));
    first.feed(ready("abc", 17));
    eventually(|| session.session().seq == Some(17)).await;

    first.feed_close(4009, "session timed out");
    eventually(|| connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(session.session(), accord::gateway::Session::default());

    second.feed(hello(45_000));
    eventually(|| second.sent_with_op(2).is_some()).await;
    assert!(second.sent_with_op(6).is_none(), "4009 must re-identify");

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn recoverable_close_resumes_with_stored_session() {
    let (first, socket_a) = scripted_socket();
    let (second, socket_b) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket_a, socket_b]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    first.feed(hello(45_000));
    first.feed(ready("abc", 5));
    eventually(|| session.session().seq == Some(5)).await;

    first.feed_close(4000, "unknown error");
    second.feed(hello(45_000));
    eventually(|| second.sent_with_op(6).is_some()).await;

    let resume = second.sent_with_op(6).expect("resume sent");
    assert_eq!(resume["d"]["session_id"], "abc");
    assert_eq!(resume["d"]["seq"], 5);
    assert_eq!(resume["d"]["token"], "tok");
    assert!(second.sent_with_op(2).is_none(), "resume, not identify");

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn missed_heartbeat_ack_forces_close() {
    let (handle, socket) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    // Short cadence, and no ACK is ever fed back.
    handle.feed(hello(50));
    eventually(|| handle.aborted()).await;
    // An ack miss drops the connection outright, no close handshake.
    assert_eq!(handle.close_code(), None);
    assert!(handle.sent_with_op(1).is_some());

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn heartbeat_ack_keeps_connection_alive() {
    let (handle, socket) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    handle.feed(hello(60));
    eventually(|| handle.sent_with_op(1).is_some()).await;
    // Acknowledge faster than the cadence; the socket must stay open across
    // several heartbeat cycles.
    for _ in 0..15 {
        handle.feed(json!({"op": 11, "d": null}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.close_code(), None);
        assert!(!handle.aborted());
    }

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn server_heartbeat_request_gets_immediate_reply() {
    let (handle, socket) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    handle.feed(hello(45_000));
    handle.feed(ready("abc", 3));
    eventually(|| session.session().seq == Some(3)).await;

    let beats_before = handle.sent_ops().iter().filter(|op| **op == 1).count();
    handle.feed(json!({"op": 1, "d": null}));
    eventually(|| {
        handle.sent_ops().iter().filter(|op| **op == 1).count() > beats_before
    })
    .await;

    let last_beat = handle
        .sent
        .lock()
        .expect("lock")
        .iter()
        .rev()
        .find(|v| v["op"] == 1)
        .cloned()
        .expect("heartbeat");
    assert_eq!(last_beat["d"], 3, "heartbeat carries the latest seq");

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn invalid_session_clears_seq_and_reidentifies() {
    let (first, socket_a) = scripted_socket();
    let (second, socket_b) = scripted_socket();
    let (connector, connects) = ScriptedConnector::new(vec![socket_a, socket_b]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    first.feed(hello(45_000));
    first.feed(ready("abc", 2));
    eventually(|| session.session().seq == Some(2)).await;

    first.feed(json!({"op": 9, "d": false}));
    eventually(|| connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(session.session().seq, None);

    second.feed(hello(45_000));
    eventually(|| second.sent_with_op(2).is_some()).await;
    assert!(second.sent_with_op(6).is_none());

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn undecodable_frame_forces_reconnect() {
    let (first, socket_a) = scripted_socket();
    let (second, socket_b) = scripted_socket();
    let (connector, connects) = ScriptedConnector::new(vec![socket_a, socket_b]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    first.feed(hello(45_000));
    first.feed_text("not a frame at all");
    eventually(|| connects.load(Ordering::SeqCst) == 2).await;
    assert_eq!(first.close_code(), Some(4000));

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn dispatch_fans_out_by_event_name_and_opcode() {
    let (handle, socket) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let by_name = Arc::new(Mutex::new(Vec::<Value>::new()));
    let by_opcode = Arc::new(Mutex::new(Vec::<Value>::new()));
    {
        let by_name = by_name.clone();
        session.on("MESSAGE_CREATE", move |payload| {
            by_name.lock().expect("lock").push(payload.clone());
        });
    }
    {
        let by_opcode = by_opcode.clone();
        session.on("DISPATCH", move |payload| {
            by_opcode.lock().expect("lock").push(payload.clone());
        });
    }

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    handle.feed(hello(45_000));
    handle.feed(ready("abc", 1));
    handle.feed(json!({
        "op": 0,
        "t": "MESSAGE_CREATE",
        "s": 2,
        "d": {"content": "hi there"}
    }));

    eventually(|| !by_name.lock().expect("lock").is_empty()).await;
    // Event-name subscribers see only `d`.
    assert_eq!(
        by_name.lock().expect("lock")[0],
        json!({"content": "hi there"})
    );
    // Opcode subscribers see the whole frame, READY included.
    eventually(|| by_opcode.lock().expect("lock").len() >= 2).await;
    let frames = by_opcode.lock().expect("lock").clone();
    assert!(frames.iter().any(|f| f["t"] == "MESSAGE_CREATE" && f["op"] == 0));

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

#[tokio::test]
async fn outbound_sends_funnel_through_send_packet() {
    let (handle, socket) = scripted_socket();
    let (connector, _connects) = ScriptedConnector::new(vec![socket]);
    let session = Arc::new(GatewaySession::with_connector(config(), connector).expect("session"));

    let runner = tokio::spawn({
        let session = session.clone();
        async move { session.run().await }
    });

    handle.feed(hello(45_000));
    handle.feed(ready("abc", 1));
    eventually(|| session.status() == Status::Ready).await;

    session
        .request_guild_members(&accord::gateway::RequestGuildMembers {
            guild_id: "77".to_owned(),
            limit: 0,
            query: Some(String::new()),
            ..Default::default()
        })
        .expect("queued");
    session
        .voice_state_update("77", Some("88"), false, true)
        .expect("queued");
    session
        .presence_update("online", false, None, None)
        .expect("queued");

    eventually(|| handle.sent_with_op(8).is_some()).await;
    let members = handle.sent_with_op(8).expect("request members");
    assert_eq!(members["d"]["guild_id"], "77");
    assert!(members["d"].get("user_ids").is_none(), "absent fields omitted");

    eventually(|| handle.sent_with_op(4).is_some()).await;
    let voice = handle.sent_with_op(4).expect("voice state");
    assert_eq!(voice["d"]["channel_id"], "88");
    assert_eq!(voice["d"]["self_deaf"], true);

    eventually(|| handle.sent_with_op(3).is_some()).await;
    let presence = handle.sent_with_op(3).expect("presence");
    assert_eq!(presence["d"]["status"], "online");
    assert!(presence["d"].get("game").is_none());

    session.close();
    runner.await.expect("join").expect("clean shutdown");
}

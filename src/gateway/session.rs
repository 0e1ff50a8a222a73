use crate::error::{GatewayClosed, Result, StateError, TransportError};
use crate::events::Emitter;
use crate::gateway::codec::{Encoding, Frame, FrameCodec, Opcode, TermCodec, WireMessage};
use crate::gateway::transport::{Connector, GatewaySocket, Payload, SocketEvent, TlsConnector};
use crate::http::API_VERSION;
use crate::intents::Intents;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, warn};
use url::Url;

/// Code used when this side tears the socket down to reconnect.
pub const RECONNECT_CLOSE_CODE: u16 = 4000;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: "accord-rs".to_owned(),
            device: "accord-rs".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IdentifyConfig {
    pub properties: IdentifyProperties,
    /// `[index, total]`; `[0, 1]` for an unsharded session.
    pub shard: Option<[u32; 2]>,
    pub large_threshold: Option<u32>,
    pub presence: Option<Value>,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub url: String,
    pub token: String,
    pub intents: Intents,
    pub encoding: Encoding,
    pub term_codec: Option<Arc<dyn TermCodec>>,
    pub compress: bool,
    pub identify: IdentifyConfig,
    pub reconnect_backoff: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "wss://gateway.accord.chat".to_owned(),
            token: String::new(),
            intents: Intents::default(),
            encoding: Encoding::Json,
            term_codec: None,
            compress: false,
            identify: IdentifyConfig::default(),
            reconnect_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Ready,
    Reconnecting,
    Closed,
}

/// Resume credentials: populated on READY, advanced on every sequenced
/// payload, cleared when the server invalidates the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub id: Option<String>,
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Serialize)]
struct Identify<'a> {
    token: &'a str,
    intents: u64,
    properties: &'a IdentifyProperties,
    shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    large_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence: Option<&'a Value>,
}

#[derive(Serialize)]
struct PresenceUpdate<'a> {
    status: &'a str,
    afk: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    game: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    since: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClosePolicy {
    /// Never reconnect: authentication failed, not authenticated, or a
    /// sharding problem the client cannot fix by retrying.
    Fatal,
    /// Reconnect, but the session is gone; the next handshake identifies.
    Reidentify,
    /// Reconnect; resume if credentials are held.
    Resume,
}

fn close_policy(code: u16) -> ClosePolicy {
    match code {
        4003 | 4004 | 4011 => ClosePolicy::Fatal,
        4007 | 4009 => ClosePolicy::Reidentify,
        _ => ClosePolicy::Resume,
    }
}

enum ConnectionEnd {
    Shutdown,
    Reconnect,
    Fatal(GatewayClosed),
}

struct Shared {
    cfg: SessionConfig,
    url: Url,
    status: RwLock<Status>,
    session: Mutex<Session>,
    emitter: Emitter,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<(Opcode, Value)>>>,
    shutdown: Notify,
    reconnect: Notify,
    closed: AtomicBool,
}

/// Owns one gateway connection end to end: handshake, heartbeat, dispatch
/// fan-out, and the resume-vs-reidentify reconnect policy.
///
/// [`GatewaySession::run`] drives the supervising loop until [`close`] is
/// called or a fatal close code arrives; callers usually spawn it.
///
/// [`close`]: GatewaySession::close
pub struct GatewaySession<C: Connector = TlsConnector> {
    shared: Arc<Shared>,
    connector: C,
}

impl GatewaySession<TlsConnector> {
    pub fn new(cfg: SessionConfig) -> Result<Self> {
        Self::with_connector(cfg, TlsConnector)
    }
}

impl<C: Connector> GatewaySession<C> {
    /// Validates the encoding choice and computes the connection URL.
    pub fn with_connector(cfg: SessionConfig, connector: C) -> Result<Self> {
        // Refuse the alternate encoding up front when no codec is installed.
        let codec = FrameCodec::new(cfg.encoding, cfg.term_codec.clone(), cfg.compress)?;
        let url = build_gateway_url(&cfg.url, &codec)?;

        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                url,
                status: RwLock::new(Status::Idle),
                session: Mutex::new(Session::default()),
                emitter: Emitter::new(),
                outbound_tx: Mutex::new(None),
                shutdown: Notify::new(),
                reconnect: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            connector,
        })
    }

    pub fn status(&self) -> Status {
        *self.shared.status.read().expect("lock not poisoned")
    }

    pub fn session(&self) -> Session {
        self.shared
            .session
            .lock()
            .expect("lock not poisoned")
            .clone()
    }

    pub fn connection_url(&self) -> &Url {
        &self.shared.url
    }

    pub fn emitter(&self) -> &Emitter {
        &self.shared.emitter
    }

    /// Register a handler. Opcode names (`"DISPATCH"`, `"HELLO"`, …) receive
    /// the full frame; dispatch event names (`"READY"`, `"MESSAGE_CREATE"`,
    /// …) receive only the event data.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.emitter.on(name, handler);
    }

    /// Stop the supervising loop immediately: the read loop is killed and
    /// the socket dropped without a close handshake. Use
    /// [`request_reconnect`] for a polite close that keeps the loop alive.
    ///
    /// [`request_reconnect`]: GatewaySession::request_reconnect
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.shutdown.notify_waiters();
    }

    /// Close the socket politely (close frame, code 4000) without killing
    /// the supervising loop; the loop reconnects and resumes where possible.
    pub fn request_reconnect(&self) {
        self.shared.reconnect.notify_waiters();
    }

    /// Queue one payload for the connection writer. All gateway sends funnel
    /// through here.
    pub fn send_packet(&self, op: Opcode, d: Value) -> Result<()> {
        let guard = self
            .shared
            .outbound_tx
            .lock()
            .expect("lock not poisoned");
        let tx = guard.as_ref().ok_or(StateError::NotConnected)?;
        tx.send((op, d)).map_err(|_| StateError::Closed)?;
        Ok(())
    }

    pub fn request_guild_members(&self, request: &RequestGuildMembers) -> Result<()> {
        self.send_packet(Opcode::RequestGuildMembers, serde_json::to_value(request)?)
    }

    pub fn voice_state_update(
        &self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        self.send_packet(
            Opcode::VoiceStateUpdate,
            json!({
                "guild_id": guild_id,
                "channel_id": channel_id,
                "self_mute": self_mute,
                "self_deaf": self_deaf,
            }),
        )
    }

    pub fn presence_update(
        &self,
        status: &str,
        afk: bool,
        game: Option<&Value>,
        since: Option<u64>,
    ) -> Result<()> {
        self.send_packet(
            Opcode::PresenceUpdate,
            serde_json::to_value(PresenceUpdate {
                status,
                afk,
                game,
                since,
            })?,
        )
    }

    /// Connect and drive the session until closed.
    ///
    /// Returns `Ok(())` after [`close`], `Err` with the close details when a
    /// fatal close code ends the session.
    ///
    /// [`close`]: GatewaySession::close
    pub async fn run(&self) -> Result<()> {
        let (tx, mut outbound) = mpsc::unbounded_channel();
        *self
            .shared
            .outbound_tx
            .lock()
            .expect("lock not poisoned") = Some(tx);
        self.shared.closed.store(false, Ordering::SeqCst);

        let mut codec = FrameCodec::new(
            self.shared.cfg.encoding,
            self.shared.cfg.term_codec.clone(),
            self.shared.cfg.compress,
        )?;
        let mut attempts = 0u32;

        let outcome = loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                break Ok(());
            }

            self.set_status(Status::Connecting);
            let mut socket = match self.connector.connect(&self.shared.url).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(url = %self.shared.url, "gateway connect failed: {e}");
                    attempts = attempts.saturating_add(1);
                    if self.backoff(attempts).await.is_err() {
                        break Ok(());
                    }
                    continue;
                }
            };

            attempts = 0;
            codec.reset();
            self.set_status(Status::AwaitingHello);
            self.shared.emitter.emit("open", &Value::Null);

            let end = match self.run_connection(&mut socket, &mut codec, &mut outbound).await {
                Ok(end) => end,
                Err(e) => {
                    warn!("gateway connection error: {e}");
                    ConnectionEnd::Reconnect
                }
            };

            match end {
                ConnectionEnd::Shutdown => {
                    socket.abort();
                    break Ok(());
                }
                ConnectionEnd::Fatal(closed) => {
                    error!(
                        code = closed.code,
                        reason = %closed.reason,
                        "gateway closed fatally, not reconnecting"
                    );
                    self.set_status(Status::Closed);
                    self.clear_outbound();
                    return Err(closed.into());
                }
                ConnectionEnd::Reconnect => {
                    self.set_status(Status::Reconnecting);
                    attempts = attempts.saturating_add(1);
                    if self.backoff(attempts).await.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.set_status(Status::Closed);
        self.clear_outbound();
        outcome
    }

    async fn run_connection<S: GatewaySocket>(
        &self,
        socket: &mut S,
        codec: &mut FrameCodec,
        outbound: &mut mpsc::UnboundedReceiver<(Opcode, Value)>,
    ) -> Result<ConnectionEnd> {
        let mut heartbeat_interval: Option<Duration> = None;
        let mut heartbeat_due: Option<Instant> = None;
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = self.shared.shutdown.notified() => {
                    return Ok(ConnectionEnd::Shutdown);
                }
                _ = self.shared.reconnect.notified() => {
                    let _ = socket.close(RECONNECT_CLOSE_CODE, "reconnect requested").await;
                    return Ok(ConnectionEnd::Reconnect);
                }
                _ = heartbeat_tick(heartbeat_due) => {
                    if awaiting_ack {
                        error!("heartbeat ack missed, dropping the connection");
                        socket.abort();
                        return Ok(ConnectionEnd::Reconnect);
                    }
                    self.send_heartbeat(socket, codec).await?;
                    awaiting_ack = true;
                    heartbeat_due = heartbeat_interval.map(|i| Instant::now() + i);
                }
                cmd = outbound.recv() => {
                    let Some((op, d)) = cmd else {
                        return Ok(ConnectionEnd::Shutdown);
                    };
                    self.send_now(socket, codec, op, d).await?;
                }
                event = socket.recv() => {
                    match event {
                        Ok(Some(SocketEvent::Message(payload))) => {
                            let frame = match decode_payload(codec, &payload) {
                                Ok(Some(frame)) => frame,
                                Ok(None) => continue,
                                Err(e) => {
                                    error!("gateway codec error, forcing reconnect: {e}");
                                    let _ = socket
                                        .close(RECONNECT_CLOSE_CODE, "undecodable frame")
                                        .await;
                                    return Ok(ConnectionEnd::Reconnect);
                                }
                            };

                            match self
                                .handle_frame(
                                    socket,
                                    codec,
                                    frame,
                                    &mut heartbeat_interval,
                                    &mut heartbeat_due,
                                    &mut awaiting_ack,
                                )
                                .await?
                            {
                                Some(end) => return Ok(end),
                                None => {}
                            }
                        }
                        Ok(Some(SocketEvent::Closed { code, reason })) => {
                            self.shared
                                .emitter
                                .emit("close", &json!({"code": code, "reason": reason}));
                            return Ok(self.classify_close(code, reason));
                        }
                        Ok(None) => {
                            debug!("gateway socket reached eof");
                            return Ok(ConnectionEnd::Reconnect);
                        }
                        Err(e) => {
                            warn!("gateway socket error: {e}");
                            return Ok(ConnectionEnd::Reconnect);
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame<S: GatewaySocket>(
        &self,
        socket: &mut S,
        codec: &FrameCodec,
        frame: Frame,
        heartbeat_interval: &mut Option<Duration>,
        heartbeat_due: &mut Option<Instant>,
        awaiting_ack: &mut bool,
    ) -> Result<Option<ConnectionEnd>> {
        if let Some(seq) = frame.s {
            self.shared
                .session
                .lock()
                .expect("lock not poisoned")
                .seq = Some(seq);
        }

        self.shared
            .emitter
            .emit(frame.op.name(), &serde_json::to_value(&frame)?);

        match frame.op {
            Opcode::Hello => {
                let Some(interval) = frame
                    .d
                    .get("heartbeat_interval")
                    .and_then(Value::as_u64)
                    .map(Duration::from_millis)
                else {
                    warn!("hello frame without heartbeat_interval, reconnecting");
                    let _ = socket.close(RECONNECT_CLOSE_CODE, "malformed hello").await;
                    return Ok(Some(ConnectionEnd::Reconnect));
                };
                *heartbeat_interval = Some(interval);
                *heartbeat_due = Some(Instant::now());
                *awaiting_ack = false;

                let session = self.session();
                if let (Some(id), Some(seq)) = (session.id, session.seq) {
                    debug!(seq, "resuming session");
                    self.set_status(Status::Resuming);
                    self.send_now(
                        socket,
                        codec,
                        Opcode::Resume,
                        json!({
                            "token": self.shared.cfg.token,
                            "session_id": id,
                            "seq": seq,
                        }),
                    )
                    .await?;
                } else {
                    debug!("identifying");
                    self.set_status(Status::Identifying);
                    let identify = Identify {
                        token: &self.shared.cfg.token,
                        intents: self.shared.cfg.intents.bits(),
                        properties: &self.shared.cfg.identify.properties,
                        shard: self.shared.cfg.identify.shard.unwrap_or([0, 1]),
                        large_threshold: self.shared.cfg.identify.large_threshold,
                        presence: self.shared.cfg.identify.presence.as_ref(),
                    };
                    self.send_now(socket, codec, Opcode::Identify, serde_json::to_value(identify)?)
                        .await?;
                }
            }
            Opcode::Heartbeat => {
                // The server may request one out of cycle.
                self.send_heartbeat(socket, codec).await?;
            }
            Opcode::HeartbeatAck => {
                *awaiting_ack = false;
            }
            Opcode::Dispatch => {
                match frame.t.as_deref() {
                    Some("READY") => {
                        if let Some(id) = frame.d.get("session_id").and_then(Value::as_str) {
                            self.shared
                                .session
                                .lock()
                                .expect("lock not poisoned")
                                .id = Some(id.to_owned());
                        }
                        self.set_status(Status::Ready);
                    }
                    Some("RESUMED") => {
                        self.set_status(Status::Ready);
                    }
                    _ => {}
                }
                if let Some(name) = &frame.t {
                    self.shared.emitter.emit(name, &frame.d);
                }
            }
            Opcode::Reconnect => {
                debug!("server requested reconnect");
                let _ = socket
                    .close(RECONNECT_CLOSE_CODE, "server requested reconnect")
                    .await;
                return Ok(Some(ConnectionEnd::Reconnect));
            }
            Opcode::InvalidSession => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                {
                    let mut session =
                        self.shared.session.lock().expect("lock not poisoned");
                    session.seq = None;
                    if !resumable {
                        session.id = None;
                    }
                }
                debug!(resumable, "session invalidated, reconnecting");
                let _ = socket.close(RECONNECT_CLOSE_CODE, "session invalidated").await;
                return Ok(Some(ConnectionEnd::Reconnect));
            }
            _ => {}
        }

        Ok(None)
    }

    async fn send_heartbeat<S: GatewaySocket>(
        &self,
        socket: &mut S,
        codec: &FrameCodec,
    ) -> Result<()> {
        let seq = self
            .shared
            .session
            .lock()
            .expect("lock not poisoned")
            .seq;
        self.send_now(
            socket,
            codec,
            Opcode::Heartbeat,
            seq.map_or(Value::Null, Value::from),
        )
        .await
    }

    async fn send_now<S: GatewaySocket>(
        &self,
        socket: &mut S,
        codec: &FrameCodec,
        op: Opcode,
        d: Value,
    ) -> Result<()> {
        match codec.encode(op, d)? {
            WireMessage::Text(text) => socket.send_text(text).await,
            WireMessage::Binary(bytes) => socket.send_binary(bytes).await,
        }
    }

    fn classify_close(&self, code: u16, reason: String) -> ConnectionEnd {
        match close_policy(code) {
            ClosePolicy::Fatal => ConnectionEnd::Fatal(GatewayClosed { code, reason }),
            ClosePolicy::Reidentify => {
                *self.shared.session.lock().expect("lock not poisoned") = Session::default();
                debug!(code, "session dropped by close code, will re-identify");
                ConnectionEnd::Reconnect
            }
            ClosePolicy::Resume => {
                debug!(code, %reason, "gateway closed, reconnecting");
                ConnectionEnd::Reconnect
            }
        }
    }

    async fn backoff(&self, attempts: u32) -> Result<()> {
        let delay = reconnect_delay(self.shared.cfg.reconnect_backoff, attempts);
        tokio::select! {
            _ = sleep(delay) => Ok(()),
            _ = self.shared.shutdown.notified() => Err(StateError::Closed.into()),
        }
    }

    fn set_status(&self, status: Status) {
        *self.shared.status.write().expect("lock not poisoned") = status;
    }

    fn clear_outbound(&self) {
        *self
            .shared
            .outbound_tx
            .lock()
            .expect("lock not poisoned") = None;
    }
}

fn decode_payload(codec: &mut FrameCodec, payload: &Payload) -> Result<Option<Frame>> {
    match payload {
        Payload::Text(text) => codec.decode_text(text).map(Some),
        Payload::Binary(bytes) => codec.decode_binary(bytes),
    }
}

fn build_gateway_url(base: &str, codec: &FrameCodec) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| TransportError::Other(format!("invalid gateway url: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("version", &API_VERSION.to_string());
        query.append_pair("encoding", codec.encoding_name());
        if codec.compressed() {
            query.append_pair("compress", "zlib-stream");
        }
    }
    Ok(url)
}

fn reconnect_delay(base: Duration, attempts: u32) -> Duration {
    let exp = 1u128 << attempts.saturating_sub(1).min(10);
    let millis = base.as_millis().saturating_mul(exp);
    Duration::from_millis(millis.min(MAX_RECONNECT_DELAY.as_millis()) as u64)
}

async fn heartbeat_tick(next: Option<Instant>) {
    match next {
        Some(instant) => {
            let now = Instant::now();
            if instant > now {
                sleep(instant - now).await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

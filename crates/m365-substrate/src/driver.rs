//! Substrate WebSocket driver.
//!
//! Each chat turn opens a fresh socket and walks the hub protocol:
//! handshake, client ping, one invocation, then update/completion frames
//! until a terminal frame, socket close, or the invocation timeout. The
//! turn is split in two: `begin_chat` performs everything up to and
//! including the invocation send — failures there happen before any byte
//! reaches the client — and `ActiveTurn::drive` consumes frames. A
//! keep-alive ping runs while the socket is open, and the socket is closed
//! with code 1000 on every exit path.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use m365_core::config::SubstrateConfig;
use m365_core::redact::redact_url;

use crate::frames;
use crate::jwt::{self, TokenClaims};

#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("bearer token is not a JWT exposing oid and tid claims")]
    InvalidToken,

    #[error("substrate connect failed: {0}")]
    Connect(String),

    #[error("substrate handshake failed: {0}")]
    Handshake(String),

    #[error("substrate invocation timed out after {0}s")]
    Timeout(u64),

    #[error("substrate chat returned no assistant content")]
    NoAssistantContent,

    #[error("substrate upstream error: {0}")]
    Upstream(String),

    #[error("websocket failure: {0}")]
    Ws(String),
}

impl SubstrateError {
    /// HTTP status this failure surfaces as.
    pub fn status(&self) -> u16 {
        match self {
            SubstrateError::InvalidToken => 400,
            SubstrateError::Timeout(_) => 504,
            _ => 502,
        }
    }
}

/// One chat turn against an existing (possibly freshly minted) conversation.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub conversation_id: String,
    /// Prompt text, already carrying its `Context:` block.
    pub prompt: String,
    pub is_start_of_session: bool,
    pub contextual_resources: Option<Value>,
    pub time_zone: String,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub text: String,
    /// Upstream-confirmed conversation id, when any frame carried one.
    pub conversation_id: Option<String>,
}

/// Streaming callback: `(delta_text, conversation_id)`.
pub trait OnUpdate: FnMut(Option<&str>, Option<&str>) + Send {}
impl<T: FnMut(Option<&str>, Option<&str>) + Send> OnUpdate for T {}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

pub struct SubstrateClient {
    cfg: SubstrateConfig,
}

impl SubstrateClient {
    pub fn new(cfg: SubstrateConfig) -> Self {
        Self { cfg }
    }

    /// Substrate conversations are minted client-side; the hub adopts the id
    /// on the first invocation of a session.
    pub fn create_conversation(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Decode the token, open the socket, complete the handshake, send the
    /// client ping and the invocation. Everything here runs before any byte
    /// is owed to the client, so callers can still fail with a plain error
    /// body.
    pub async fn begin_chat(
        &self,
        bearer_token: &str,
        turn: &TurnRequest,
    ) -> Result<ActiveTurn, SubstrateError> {
        let claims = jwt::decode_claims(bearer_token).ok_or(SubstrateError::InvalidToken)?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let url = self.hub_url(bearer_token, &claims, &turn.conversation_id, &session_id);
        debug!(url = %redact_url(&url), "opening substrate socket");

        let mut request = url
            .into_client_request()
            .map_err(|e| SubstrateError::Connect(e.to_string()))?;
        if !self.cfg.origin.is_empty() {
            let origin = HeaderValue::from_str(&self.cfg.origin)
                .map_err(|e| SubstrateError::Connect(e.to_string()))?;
            request.headers_mut().insert("Origin", origin);
        }

        let timeout = Duration::from_secs(self.cfg.invocation_timeout_seconds.max(1));
        let (socket, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| SubstrateError::Timeout(self.cfg.invocation_timeout_seconds))?
            .map_err(|e| SubstrateError::Connect(e.to_string()))?;
        let (sink, source) = socket.split();

        let mut active = ActiveTurn {
            sink,
            source,
            invocation_timeout_seconds: self.cfg.invocation_timeout_seconds,
            keep_alive_seconds: self.cfg.keep_alive_seconds,
        };
        if let Err(err) = active.open(&self.invocation_frame(turn, &session_id)).await {
            let _ = active.close().await;
            return Err(err);
        }
        Ok(active)
    }

    /// Buffered turn: connect, invoke, and drive to completion.
    pub async fn chat(
        &self,
        bearer_token: &str,
        turn: &TurnRequest,
        on_update: impl OnUpdate,
    ) -> Result<TurnOutcome, SubstrateError> {
        self.begin_chat(bearer_token, turn).await?.drive(on_update).await
    }

    fn hub_url(
        &self,
        token: &str,
        claims: &TokenClaims,
        conversation_id: &str,
        session_id: &str,
    ) -> String {
        let cfg = &self.cfg;
        let mut url = format!(
            "wss://{}/{}@{}?ClientRequestId={}&X-SessionId={}&ConversationId={}&access_token={}",
            cfg.hub_path.trim_matches('/'),
            urlencoding::encode(&claims.oid),
            urlencoding::encode(&claims.tid),
            uuid::Uuid::new_v4(),
            session_id,
            urlencoding::encode(conversation_id),
            urlencoding::encode(token),
        );
        if !cfg.source.is_empty() {
            if cfg.quote_source_in_query {
                url.push_str(&format!(
                    "&source=%22{}%22",
                    urlencoding::encode(&cfg.source)
                ));
            } else {
                url.push_str(&format!("&source={}", urlencoding::encode(&cfg.source)));
            }
        }
        for (key, value) in [
            ("scenario", &cfg.scenario),
            ("product", &cfg.product),
            ("agentHost", &cfg.agent_host),
            ("licenseType", &cfg.license_type),
            ("agent", &cfg.agent),
            ("variants", &cfg.variants),
        ] {
            if !value.is_empty() {
                url.push_str(&format!("&{key}={}", urlencoding::encode(value)));
            }
        }
        url
    }

    fn invocation_frame(&self, turn: &TurnRequest, session_id: &str) -> Value {
        let cfg = &self.cfg;
        let mut message = serde_json::json!({
            "author": "user",
            "text": turn.prompt,
            "inputMethod": "Keyboard",
            "locale": cfg.locale,
            "experienceType": cfg.experience_type,
            "locationInfo": {
                "timeZone": turn.time_zone,
                "timeZoneOffset": time_zone_offset_minutes(&turn.time_zone),
            },
        });
        if !cfg.entity_annotation_types.is_empty() {
            message["entityAnnotationTypes"] =
                serde_json::json!(cfg.entity_annotation_types);
        }

        let mut argument = serde_json::json!({
            "source": cfg.source,
            "clientCorrelationId": uuid::Uuid::new_v4().to_string(),
            "sessionId": session_id,
            "conversationId": turn.conversation_id,
            "traceId": uuid::Uuid::new_v4().simple().to_string(),
            "isStartOfSession": turn.is_start_of_session,
            "productThreadType": cfg.product_thread_type,
            "clientInfo": {"clientPlatform": cfg.client_platform},
            "message": message,
            "optionsSets": cfg.options_sets,
            "allowedMessageTypes": cfg.allowed_message_types,
        });
        if let Some(resources) = &turn.contextual_resources {
            argument["contextualResources"] = resources.clone();
        }

        serde_json::json!({
            "arguments": [argument],
            "invocationId": "0",
            "target": cfg.invocation_target,
            "type": cfg.invocation_type,
        })
    }
}

/// A connected, invoked turn, ready to consume frames.
pub struct ActiveTurn {
    sink: WsSink,
    source: WsSource,
    invocation_timeout_seconds: u64,
    keep_alive_seconds: u64,
}

impl std::fmt::Debug for ActiveTurn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTurn")
            .field("invocation_timeout_seconds", &self.invocation_timeout_seconds)
            .field("keep_alive_seconds", &self.keep_alive_seconds)
            .finish()
    }
}

impl ActiveTurn {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_seconds.max(1))
    }

    /// Handshake, ack check, client ping, invocation.
    async fn open(&mut self, invocation: &Value) -> Result<(), SubstrateError> {
        send_record(&mut self.sink, &serde_json::json!({"protocol": "json", "version": 1}))
            .await?;
        let ack = tokio::time::timeout(self.timeout(), self.source.next())
            .await
            .map_err(|_| SubstrateError::Timeout(self.invocation_timeout_seconds))?
            .ok_or_else(|| {
                SubstrateError::Handshake("socket closed before handshake ack".to_string())
            })?
            .map_err(|e| SubstrateError::Ws(e.to_string()))?;
        if let Message::Text(text) = &ack {
            for frame in frames::parse_records(text) {
                if let Some(err) = frames::error_message(&frame) {
                    return Err(SubstrateError::Handshake(err));
                }
            }
        }

        send_record(&mut self.sink, &serde_json::json!({"type": 6})).await?;
        send_record(&mut self.sink, invocation).await
    }

    /// Consume frames to the terminal condition, then close 1000.
    pub async fn drive(
        mut self,
        mut on_update: impl OnUpdate,
    ) -> Result<TurnOutcome, SubstrateError> {
        let result = self.receive(&mut on_update).await;
        let _ = self.close().await;
        result
    }

    async fn receive(
        &mut self,
        on_update: &mut impl OnUpdate,
    ) -> Result<TurnOutcome, SubstrateError> {
        let timeout = self.timeout();
        let keep_alive = Duration::from_secs(self.keep_alive_seconds.max(1));
        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + keep_alive,
            keep_alive,
        );
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut deadline = tokio::time::Instant::now() + timeout;
        let mut deltas = String::new();
        let mut last_bot: Option<String> = None;
        let mut conversation_id: Option<String> = None;
        let mut upstream_error: Option<String> = None;

        'receive: loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(SubstrateError::Timeout(self.invocation_timeout_seconds));
                }
                _ = ping.tick() => {
                    send_record(&mut self.sink, &serde_json::json!({"type": 6})).await?;
                }
                msg = self.source.next() => {
                    let Some(msg) = msg else { break 'receive };
                    let msg = msg.map_err(|e| SubstrateError::Ws(e.to_string()))?;
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Close(_) => break 'receive,
                        _ => continue,
                    };
                    deadline = tokio::time::Instant::now() + timeout;
                    for frame in frames::parse_records(&text) {
                        if let Some(id) = frames::conversation_id(&frame) {
                            if conversation_id.as_deref() != Some(id.as_str()) {
                                on_update(None, Some(&id));
                                conversation_id = Some(id);
                            }
                        }
                        if let Some(err) = frames::error_message(&frame) {
                            warn!(error = %err, "substrate frame carried an error");
                            upstream_error.get_or_insert(err);
                        }
                        for delta in frames::cursor_deltas(&frame) {
                            deltas.push_str(&delta);
                            on_update(Some(&delta), conversation_id.as_deref());
                        }
                        if let Some(text) = frames::bot_message_text(&frame) {
                            last_bot = Some(text);
                        }
                        if let Some(failure) = frames::result_failure(&frame) {
                            upstream_error.get_or_insert(failure);
                        }
                        if frames::is_terminal(&frame) {
                            break 'receive;
                        }
                    }
                }
            }
        }

        if let Some(err) = upstream_error {
            return Err(SubstrateError::Upstream(err));
        }
        // bot snapshots win over accumulated cursor deltas
        let text = last_bot.unwrap_or(deltas);
        if text.is_empty() {
            return Err(SubstrateError::NoAssistantContent);
        }
        Ok(TurnOutcome {
            text,
            conversation_id,
        })
    }

    async fn close(&mut self) -> Result<(), SubstrateError> {
        self.sink
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .map_err(|e| SubstrateError::Ws(e.to_string()))
    }
}

async fn send_record(sink: &mut WsSink, payload: &Value) -> Result<(), SubstrateError> {
    sink.send(Message::Text(frames::encode(payload)))
        .await
        .map_err(|e| SubstrateError::Ws(e.to_string()))
}

/// Offset in minutes for the invocation's location info. UTC is zero; any
/// other zone uses the host offset, which matches the zone the proxy is
/// deployed in.
fn time_zone_offset_minutes(time_zone: &str) -> i32 {
    if time_zone.eq_ignore_ascii_case("utc") {
        return 0;
    }
    chrono::Local::now().offset().local_minus_utc() / 60
}

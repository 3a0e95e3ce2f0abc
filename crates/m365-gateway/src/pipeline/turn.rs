//! Turn execution against either transport, including the two single-shot
//! recovery policies: the substrate empty-assistant recreate and the
//! strict-tool retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use m365_core::{ProxyError, Result, Transport};
use m365_graph::snapshot;
use m365_openai::request::CanonicalRequest;
use m365_openai::toolcall::{self, AssistantResponse};
use m365_substrate::{ActiveTurn, SubstrateError, TurnRequest};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::pipeline::{map_graph, map_substrate, TurnScope};
use crate::token::raw_token;

/// Upstream chat payload for the Graph transport.
pub(crate) fn graph_payload(req: &CanonicalRequest) -> Value {
    let mut location = serde_json::json!({"timeZone": req.location.time_zone});
    if let Some(country) = &req.location.country_or_region {
        location["countryOrRegion"] = Value::String(country.clone());
    }
    let mut payload = serde_json::json!({
        "message": {"text": req.prompt_with_context()},
        "locationInfo": location,
    });
    if let Some(resources) = &req.contextual_resources {
        payload["contextualResources"] = resources.clone();
    }
    if let Some(t) = req.temperature {
        payload["temperature"] = serde_json::json!(t);
    }
    if let Some(effort) = &req.reasoning_effort {
        payload["reasoningEffort"] = Value::String(effort.clone());
    }
    payload
}

fn substrate_turn(
    req: &CanonicalRequest,
    conversation_id: &str,
    is_start_of_session: bool,
) -> TurnRequest {
    TurnRequest {
        conversation_id: conversation_id.to_string(),
        prompt: req.prompt_with_context(),
        is_start_of_session,
        contextual_resources: req.contextual_resources.clone(),
        time_zone: req.location.time_zone.clone(),
    }
}

/// Run one buffered turn, returning the raw assistant text.
///
/// On substrate, a first turn on a conversation this request created that
/// comes back with no assistant content recreates the conversation and
/// retries exactly once.
pub(crate) async fn buffered_turn(
    state: &AppState,
    auth: &str,
    req: &CanonicalRequest,
    scope: &mut TurnScope,
) -> Result<String> {
    match scope.transport {
        Transport::Graph => {
            let body = state
                .graph
                .chat(auth, &scope.conversation_id, &graph_payload(req))
                .await
                .map_err(map_graph)?;
            scope.turns_completed += 1;
            // exclusion must match what was actually sent upstream — the
            // full Context:-prefixed prompt, not the bare last user turn
            snapshot::latest_assistant_text(&body, &req.prompt_with_context()).ok_or_else(
                || ProxyError::Graph {
                    status: 502,
                    message: "graph chat returned no assistant content".to_string(),
                },
            )
        }
        Transport::Substrate => {
            let token = raw_token(auth).to_string();
            loop {
                let turn =
                    substrate_turn(req, &scope.conversation_id, scope.is_start_of_session());
                match state.substrate.chat(&token, &turn, |_, _| {}).await {
                    Ok(outcome) => {
                        scope.turns_completed += 1;
                        if let Some(id) = outcome.conversation_id {
                            scope.conversation_id = id;
                        }
                        state
                            .conversations
                            .set(&scope.scoped_key, &scope.conversation_id);
                        return Ok(outcome.text);
                    }
                    Err(SubstrateError::NoAssistantContent)
                        if scope.is_start_of_session() && !scope.empty_retry_used =>
                    {
                        warn!("substrate returned no assistant content on a fresh conversation; recreating once");
                        scope.empty_retry_used = true;
                        scope.conversation_id = state.substrate.create_conversation();
                        state
                            .conversations
                            .set(&scope.scoped_key, &scope.conversation_id);
                    }
                    Err(e) => return Err(map_substrate(e)),
                }
            }
        }
    }
}

/// Buffered turn plus assistant-response building and the strict-tool retry.
///
/// A strict violation on substrate re-runs the turn once before the 400 is
/// surfaced.
pub(crate) async fn run_turn_with_policies(
    state: &AppState,
    auth: &str,
    req: &CanonicalRequest,
    scope: &mut TurnScope,
) -> Result<AssistantResponse> {
    let text = buffered_turn(state, auth, req, scope).await?;
    let mut assistant = toolcall::build(req, &text);

    if assistant.strict_tool_error.is_some() && scope.transport == Transport::Substrate {
        debug!("strict tool output violated; retrying substrate turn once");
        let text = buffered_turn(state, auth, req, scope).await?;
        assistant = toolcall::build(req, &text);
    }

    if let Some(message) = assistant.strict_tool_error.take() {
        return Err(ProxyError::InvalidToolOutput(message));
    }
    Ok(assistant)
}

/// Items flowing from a live substrate turn to the SSE producer.
pub(crate) enum LiveEvent {
    Delta(String),
    /// Final assistant text (deltas may be a prefix of it) and the
    /// conversation the turn ended up on.
    Done {
        text: String,
        conversation_id: String,
    },
    Failed(ProxyError),
}

/// Connect and invoke the first substrate attempt. This awaits the whole
/// pre-stream phase — token decode, socket dial, handshake, invocation — so
/// failures still produce a plain JSON error body, exactly like the Graph
/// branch gating on `chat_over_stream`.
pub(crate) async fn begin_substrate_stream(
    state: &AppState,
    auth: &str,
    req: &CanonicalRequest,
    scope: &TurnScope,
) -> Result<(String, ActiveTurn)> {
    let token = raw_token(auth).to_string();
    let turn = substrate_turn(req, &scope.conversation_id, scope.is_start_of_session());
    let active = state
        .substrate
        .begin_chat(&token, &turn)
        .await
        .map_err(map_substrate)?;
    Ok((token, active))
}

/// Drive a connected substrate turn on a background task. The
/// empty-assistant recreate retry applies only while no delta has been
/// forwarded — once a byte is out, failures surface as stream errors; the
/// retry's own reconnect runs mid-stream and fails the same way.
pub(crate) fn spawn_substrate_stream(
    state: Arc<AppState>,
    token: String,
    req: CanonicalRequest,
    scope: &TurnScope,
    first: ActiveTurn,
) -> mpsc::UnboundedReceiver<LiveEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    let scoped_key = scope.scoped_key.clone();
    let mut conversation_id = scope.conversation_id.clone();
    let created = scope.created;

    tokio::spawn(async move {
        let mut pending = Some(first);
        for attempt in 0..2u8 {
            let active = match pending.take() {
                Some(active) => active,
                None => {
                    // recreated conversation: reconnect as a fresh session
                    let turn = substrate_turn(&req, &conversation_id, true);
                    match state.substrate.begin_chat(&token, &turn).await {
                        Ok(active) => active,
                        Err(e) => {
                            let _ = tx.send(LiveEvent::Failed(map_substrate(e)));
                            return;
                        }
                    }
                }
            };

            let sent_any = Arc::new(AtomicBool::new(false));
            let sent_flag = sent_any.clone();
            let delta_tx = tx.clone();
            let drive = active.drive(move |delta, _conversation| {
                if let Some(d) = delta {
                    sent_flag.store(true, Ordering::Relaxed);
                    let _ = delta_tx.send(LiveEvent::Delta(d.to_string()));
                }
            });
            // client disconnect drops the receiver; abandon the socket at the
            // next suspension point instead of finishing the turn
            let result = tokio::select! {
                _ = tx.closed() => return,
                result = drive => result,
            };

            match result {
                Ok(outcome) => {
                    if let Some(id) = outcome.conversation_id {
                        conversation_id = id;
                    }
                    state.conversations.set(&scoped_key, &conversation_id);
                    let _ = tx.send(LiveEvent::Done {
                        text: outcome.text,
                        conversation_id: conversation_id.clone(),
                    });
                    return;
                }
                Err(SubstrateError::NoAssistantContent)
                    if created && attempt == 0 && !sent_any.load(Ordering::Relaxed) =>
                {
                    warn!("substrate stream produced no assistant content; recreating once");
                    conversation_id = state.substrate.create_conversation();
                    state.conversations.set(&scoped_key, &conversation_id);
                }
                Err(e) => {
                    let _ = tx.send(LiveEvent::Failed(map_substrate(e)));
                    return;
                }
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use m365_core::config::ProxyConfig;
    use m365_openai::request::parse_chat;
    use serde_json::json;

    #[test]
    fn graph_payload_carries_context_and_hints() {
        let req = parse_chat(
            &json!({
                "messages": [
                    {"role": "system", "content": "be kind"},
                    {"role": "user", "content": "hi"},
                ],
                "temperature": 0.2,
                "m365_country_or_region": "DE",
                "m365_contextual_resources": {"files": []},
            }),
            &ProxyConfig::default(),
        )
        .unwrap();
        let payload = graph_payload(&req);
        let text = payload["message"]["text"].as_str().unwrap();
        assert!(text.starts_with("Context:\nsystem: be kind"));
        assert!(text.ends_with("User: hi"));
        assert_eq!(payload["locationInfo"]["timeZone"], "UTC");
        assert_eq!(payload["locationInfo"]["countryOrRegion"], "DE");
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["contextualResources"]["files"], json!([]));
    }

    #[test]
    fn snapshot_exclusion_matches_the_sent_prompt() {
        // with additional context, what goes upstream is the Context: block,
        // and that is what an echoing snapshot must be excluded against
        let req = parse_chat(
            &json!({"messages": [
                {"role": "system", "content": "be kind"},
                {"role": "user", "content": "hi"},
            ]}),
            &ProxyConfig::default(),
        )
        .unwrap();
        let payload = graph_payload(&req);
        let sent = payload["message"]["text"].as_str().unwrap();
        assert_eq!(sent, req.prompt_with_context());

        // first snapshot: upstream has only echoed the sent text
        let echo = json!({"messages": [{"text": sent}]});
        assert_eq!(
            snapshot::latest_excluding_prompt(&echo, &req.prompt_with_context()),
            None
        );
        // excluding only the bare user turn would leak the whole block
        assert_eq!(
            snapshot::latest_excluding_prompt(&echo, &req.prompt_text),
            Some(sent.to_string())
        );

        // once real assistant text arrives it is extracted as usual
        let later = json!({"messages": [
            {"text": sent},
            {"text": "Hello there."},
        ]});
        assert_eq!(
            snapshot::latest_excluding_prompt(&later, &req.prompt_with_context()),
            Some("Hello there.".to_string())
        );
    }
}

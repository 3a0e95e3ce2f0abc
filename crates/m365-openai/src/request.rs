//! Chat Completions request parsing.
//!
//! Normalizes whatever an OpenAI SDK sends — string content, part arrays,
//! tool messages, `m365_*` extension fields — into one canonical record the
//! pipeline and both transports consume.

use m365_core::config::ProxyConfig;
use m365_core::{json, ProxyError, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
    /// `tool_choice: {type: "function", function: {name}}`
    Function,
}

#[derive(Debug, Clone)]
pub struct Tooling {
    pub tools: Vec<ToolDef>,
    pub choice_mode: ToolChoiceMode,
    pub choice_function: Option<String>,
    pub parallel_tool_calls: bool,
}

impl Tooling {
    pub fn declares(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    /// Extraction runs only when tools are declared and mode is not `none`.
    pub fn extraction_enabled(&self) -> bool {
        !self.tools.is_empty() && self.choice_mode != ToolChoiceMode::None
    }

    pub fn strict(&self) -> bool {
        matches!(
            self.choice_mode,
            ToolChoiceMode::Required | ToolChoiceMode::Function
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextEntry {
    pub text: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocationHint {
    /// Always set; defaults from config.
    pub time_zone: String,
    pub country_or_region: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema { schema: Option<Value> },
}

/// `m365_*` body extensions — routing hints that never collide with OpenAI
/// fields.
#[derive(Debug, Clone, Default)]
pub struct M365Extensions {
    pub transport: Option<String>,
    pub conversation_id: Option<String>,
    pub conversation_key: Option<String>,
    pub new_conversation: bool,
}

#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub model: String,
    pub stream: bool,
    /// The last user turn (or last message when no user turn exists).
    pub prompt_text: String,
    /// Prior turns plus synthetic hints, in order.
    pub additional_context: Vec<ContextEntry>,
    pub location: LocationHint,
    pub contextual_resources: Option<Value>,
    pub tooling: Tooling,
    pub response_format: Option<ResponseFormat>,
    pub reasoning_effort: Option<String>,
    pub temperature: Option<f64>,
    /// Per-user fallback conversation key.
    pub user_key: String,
    pub extensions: M365Extensions,
}

impl CanonicalRequest {
    /// Requests carrying tools or a response format must run buffered so the
    /// full assistant text is available for extraction.
    pub fn must_buffer(&self) -> bool {
        !self.tooling.tools.is_empty() || self.response_format.is_some()
    }

    /// The upstream prompt: a `Context:` block of the additional context
    /// lines (when any) followed by `User: <prompt>`.
    pub fn prompt_with_context(&self) -> String {
        if self.additional_context.is_empty() {
            return self.prompt_text.clone();
        }
        let mut out = String::from("Context:\n");
        for entry in &self.additional_context {
            out.push_str(&entry.text);
            out.push('\n');
        }
        out.push_str("\nUser: ");
        out.push_str(&self.prompt_text);
        out
    }
}

/// Parse a decoded Chat Completions body.
pub fn parse_chat(body: &Value, cfg: &ProxyConfig) -> Result<CanonicalRequest> {
    let messages = json::array_field(body, "messages")
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            ProxyError::InvalidRequest("messages must be a non-empty array".to_string())
        })?;

    let prompt_idx = messages
        .iter()
        .rposition(|m| json::str_field(m, "role") == Some("user"))
        .unwrap_or(messages.len() - 1);
    let prompt_msg = &messages[prompt_idx];
    let prompt_text = content_to_text(
        json::str_field(prompt_msg, "role").unwrap_or("user"),
        prompt_msg.get("content"),
    )
    .or_else(|| context_line(prompt_msg))
    .unwrap_or_default();

    let mut additional_context = Vec::new();
    if let Some(sys) = json::str_field(body, "m365_system_prompt") {
        additional_context.push(ContextEntry {
            text: format!("system: {sys}"),
            description: Some("system prompt".to_string()),
        });
    }
    for (i, msg) in messages.iter().enumerate() {
        if i == prompt_idx {
            continue;
        }
        if let Some(line) = context_line(msg) {
            additional_context.push(ContextEntry {
                text: line,
                description: None,
            });
        }
    }
    if let Some(extra) = json::array_field(body, "m365_additional_context") {
        for item in extra {
            match item {
                Value::String(s) if !s.is_empty() => additional_context.push(ContextEntry {
                    text: s.clone(),
                    description: None,
                }),
                Value::Object(_) => {
                    if let Some(text) = json::str_field(item, "text") {
                        additional_context.push(ContextEntry {
                            text: text.to_string(),
                            description: json::str_field(item, "description").map(String::from),
                        });
                    }
                }
                _ => {}
            }
        }
    }

    let tooling = parse_tooling(body)?;
    additional_context.extend(compat_context(&tooling));
    truncate_oldest(
        &mut additional_context,
        cfg.max_additional_context_messages,
    );

    let location = parse_location(body, cfg);
    let response_format = parse_response_format(body.get("response_format"));

    Ok(CanonicalRequest {
        model: json::str_field(body, "model")
            .unwrap_or(&cfg.default_model)
            .to_string(),
        stream: json::bool_field(body, "stream").unwrap_or(false),
        prompt_text,
        additional_context,
        location,
        contextual_resources: body.get("m365_contextual_resources").cloned(),
        tooling,
        response_format,
        reasoning_effort: json::str_field(body, "reasoning_effort").map(String::from),
        temperature: body.get("temperature").and_then(Value::as_f64),
        user_key: json::str_field(body, "user").unwrap_or("default").to_string(),
        extensions: parse_extensions(body),
    })
}

fn parse_extensions(body: &Value) -> M365Extensions {
    M365Extensions {
        transport: json::str_field(body, "m365_transport")
            .or_else(|| json::str_field(body, "transport"))
            .map(String::from),
        conversation_id: json::str_field(body, "m365_conversation_id").map(String::from),
        conversation_key: json::str_field(body, "m365_conversation_key").map(String::from),
        new_conversation: flexible_bool(body.get("m365_new_conversation")),
    }
}

/// Accepts `true`, `"true"`, `"1"`.
pub fn flexible_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

fn parse_location(body: &Value, cfg: &ProxyConfig) -> LocationHint {
    let hint = body.get("m365_location_hint");
    let time_zone = json::str_field(body, "m365_time_zone")
        .or_else(|| hint.and_then(|h| json::str_field(h, "timeZone")))
        .unwrap_or(&cfg.default_time_zone)
        .to_string();
    let country_or_region = json::str_field(body, "m365_country_or_region")
        .or_else(|| hint.and_then(|h| json::str_field(h, "countryOrRegion")))
        .map(String::from);
    LocationHint {
        time_zone,
        country_or_region,
    }
}

pub(crate) fn parse_response_format(rf: Option<&Value>) -> Option<ResponseFormat> {
    let rf = rf?;
    match json::str_field(rf, "type")? {
        "json_object" => Some(ResponseFormat::JsonObject),
        "json_schema" => {
            let schema = rf
                .get("json_schema")
                .and_then(|js| js.get("schema"))
                .or_else(|| rf.get("schema"))
                .cloned();
            Some(ResponseFormat::JsonSchema { schema })
        }
        _ => None,
    }
}

fn parse_tooling(body: &Value) -> Result<Tooling> {
    let mut tools = Vec::new();
    if let Some(raw) = json::array_field(body, "tools") {
        for t in raw {
            // Only `type = function` entries count; tolerate a flattened shape.
            let declared_type = json::str_field(t, "type").unwrap_or("function");
            if declared_type != "function" {
                continue;
            }
            let f = t.get("function").unwrap_or(t);
            let Some(name) = json::str_field(f, "name") else {
                continue;
            };
            tools.push(ToolDef {
                name: name.to_string(),
                description: json::str_field(f, "description").map(String::from),
                parameters: f.get("parameters").cloned().unwrap_or_else(|| {
                    Value::Object(serde_json::Map::new())
                }),
            });
        }
    }

    let (choice_mode, choice_function) = match body.get("tool_choice") {
        None | Some(Value::Null) => {
            if tools.is_empty() {
                (ToolChoiceMode::None, None)
            } else {
                (ToolChoiceMode::Auto, None)
            }
        }
        Some(Value::String(s)) => match s.as_str() {
            "auto" => (ToolChoiceMode::Auto, None),
            "none" => (ToolChoiceMode::None, None),
            "required" => (ToolChoiceMode::Required, None),
            other => {
                return Err(ProxyError::InvalidRequest(format!(
                    "unsupported tool_choice: {other}"
                )))
            }
        },
        Some(obj) if obj.is_object() => {
            let name = json::path(obj, &["function", "name"])
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    ProxyError::InvalidRequest(
                        "tool_choice object must name a function".to_string(),
                    )
                })?;
            (ToolChoiceMode::Function, Some(name.to_string()))
        }
        Some(_) => {
            return Err(ProxyError::InvalidRequest(
                "tool_choice must be a string or object".to_string(),
            ))
        }
    };

    if matches!(
        choice_mode,
        ToolChoiceMode::Required | ToolChoiceMode::Function
    ) && tools.is_empty()
    {
        return Err(ProxyError::InvalidRequest(
            "tool_choice requires at least one declared tool".to_string(),
        ));
    }

    Ok(Tooling {
        tools,
        choice_mode,
        choice_function,
        parallel_tool_calls: json::bool_field(body, "parallel_tool_calls").unwrap_or(true),
    })
}

/// Synthetic context entries describing the tool-call reply contract.
fn compat_context(tooling: &Tooling) -> Vec<ContextEntry> {
    if !tooling.extraction_enabled() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(3);
    out.push(ContextEntry {
        text: "When you decide to call a function, reply with only a JSON object of the form \
               {\"tool_calls\":[{\"name\":\"<function>\",\"arguments\":{...}}]} and no other text."
            .to_string(),
        description: Some("tool-calling contract".to_string()),
    });
    let listing: Vec<Value> = tooling
        .tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    out.push(ContextEntry {
        text: format!(
            "Available functions: {}",
            serde_json::to_string(&listing).unwrap_or_else(|_| "[]".to_string())
        ),
        description: Some("tool list".to_string()),
    });
    let constraint = match tooling.choice_mode {
        ToolChoiceMode::Auto => "You may call a function when it helps answer.".to_string(),
        ToolChoiceMode::Required => {
            "You must call one of the available functions this turn.".to_string()
        }
        ToolChoiceMode::Function => format!(
            "You must call the function \"{}\" this turn.",
            tooling.choice_function.as_deref().unwrap_or_default()
        ),
        ToolChoiceMode::None => unreachable!("extraction_enabled excludes none"),
    };
    out.push(ContextEntry {
        text: constraint,
        description: Some("tool-choice constraint".to_string()),
    });
    out
}

fn truncate_oldest(entries: &mut Vec<ContextEntry>, cap: usize) {
    if cap > 0 && entries.len() > cap {
        entries.drain(..entries.len() - cap);
    }
}

/// One context line for a non-prompt message.
///
/// Tool messages and assistant tool-call records carry their own prefix;
/// everything else is `"<role>: <content>"`.
pub(crate) fn context_line(msg: &Value) -> Option<String> {
    let role = json::str_field(msg, "role").unwrap_or("user");
    if role == "tool" {
        let id = json::str_field(msg, "tool_call_id").unwrap_or("unknown");
        let payload = content_to_text(role, msg.get("content"))
            .or_else(|| msg.get("content").map(|c| c.to_string()))?;
        return Some(format!("tool[{id}]: {payload}"));
    }
    if role == "assistant" {
        if let Some(calls @ Value::Array(_)) = msg.get("tool_calls") {
            let text = content_to_text(role, msg.get("content")).unwrap_or_default();
            if text.is_empty() {
                return Some(format!("assistant tool_calls: {calls}"));
            }
        }
    }
    let text = content_to_text(role, msg.get("content"))?;
    Some(format!("{role}: {text}"))
}

/// Extract plain text from a `content` field: a string, a `{text}`/`{value}`
/// object, or a part array. Image parts become `[<role> attached image: <url>]`
/// markers.
pub(crate) fn content_to_text(role: &str, content: Option<&Value>) -> Option<String> {
    let content = content?;
    let text = match content {
        Value::String(s) => s.clone(),
        Value::Object(_) => json::first_str(content, &["text", "value"])?.to_string(),
        Value::Array(parts) => {
            let mut lines = Vec::new();
            for part in parts {
                match part {
                    Value::String(s) if !s.is_empty() => lines.push(s.clone()),
                    Value::Object(_) => {
                        let part_type = json::str_field(part, "type").unwrap_or("text");
                        match part_type {
                            "text" | "input_text" | "output_text" => {
                                if let Some(t) = json::str_field(part, "text") {
                                    lines.push(t.to_string());
                                }
                            }
                            "image_url" | "input_image" => {
                                if let Some(url) = image_url(part) {
                                    lines.push(format!("[{role} attached image: {url}]"));
                                }
                            }
                            _ => {
                                if let Some(t) = json::str_field(part, "text") {
                                    lines.push(t.to_string());
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            lines.join("\n")
        }
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn image_url(part: &Value) -> Option<String> {
    match part.get("image_url") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(obj) => json::str_field(obj, "url").map(String::from),
        None => json::str_field(part, "url").map(String::from),
    }
}

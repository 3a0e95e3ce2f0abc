//! Graph transport: REST conversation creation, buffered chat, and the SSE
//! chat stream.

use m365_core::config::ProxyConfig;
use m365_core::json;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("graph API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("graph response parse error: {0}")]
    Parse(String),
}

pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
    create_path: String,
    chat_template: String,
    stream_template: String,
}

impl GraphClient {
    pub fn new(cfg: &ProxyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.graph_base_url.trim_end_matches('/').to_string(),
            create_path: cfg.create_conversation_path.clone(),
            chat_template: cfg.chat_path_template.clone(),
            stream_template: cfg.chat_over_stream_path_template.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `{conversationId}` is percent-encoded into the template.
    fn fill_template(template: &str, conversation_id: &str) -> String {
        template.replace(
            "{conversationId}",
            urlencoding::encode(conversation_id).as_ref(),
        )
    }

    /// POST the create-conversation path; success is a 2xx carrying a string
    /// `id`.
    pub async fn create_conversation(&self, auth: &str) -> Result<String, GraphError> {
        let url = self.url(&self.create_path);
        debug!(url = %url, "creating graph conversation");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", auth)
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "graph create conversation failed");
            return Err(GraphError::Api {
                status,
                message: extract_upstream_message(&text),
            });
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| GraphError::Parse(e.to_string()))?;
        json::str_field(&body, "id")
            .map(String::from)
            .ok_or_else(|| {
                GraphError::Parse("create conversation response carries no id".to_string())
            })
    }

    /// Buffered chat turn; returns the decoded JSON body.
    pub async fn chat(
        &self,
        auth: &str,
        conversation_id: &str,
        payload: &Value,
    ) -> Result<Value, GraphError> {
        let url = self.url(&Self::fill_template(&self.chat_template, conversation_id));
        debug!(url = %url, "graph chat");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", auth)
            .json(payload)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "graph chat failed");
            return Err(GraphError::Api {
                status,
                message: extract_upstream_message(&text),
            });
        }

        resp.json().await.map_err(|e| GraphError::Parse(e.to_string()))
    }

    /// Streamed chat turn; returns the raw response for the SSE pump.
    pub async fn chat_over_stream(
        &self,
        auth: &str,
        conversation_id: &str,
        payload: &Value,
    ) -> Result<reqwest::Response, GraphError> {
        let url = self.url(&Self::fill_template(&self.stream_template, conversation_id));
        debug!(url = %url, "graph chat over stream");

        let resp = self
            .client
            .post(&url)
            .header("Authorization", auth)
            .header("Accept", "text/event-stream")
            .json(payload)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "graph stream open failed");
            return Err(GraphError::Api {
                status,
                message: extract_upstream_message(&text),
            });
        }
        Ok(resp)
    }
}

/// Best-effort extraction of an upstream error message from a response body.
pub fn extract_upstream_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = json::path(&v, &["error", "message"]).and_then(Value::as_str) {
            return msg.to_string();
        }
        if let Some(msg) = json::str_field(&v, "message") {
            return msg.to_string();
        }
    }
    if body.trim().is_empty() {
        "upstream returned an error with no body".to_string()
    } else {
        body.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution_percent_encodes() {
        let path = GraphClient::fill_template(
            "/beta/copilot/conversations/{conversationId}/chat",
            "a/b c",
        );
        assert_eq!(path, "/beta/copilot/conversations/a%2Fb%20c/chat");
    }

    #[test]
    fn upstream_message_extraction() {
        assert_eq!(
            extract_upstream_message(r#"{"error":{"message":"token expired"}}"#),
            "token expired"
        );
        assert_eq!(
            extract_upstream_message(r#"{"message":"bad request"}"#),
            "bad request"
        );
        assert_eq!(extract_upstream_message("plain failure"), "plain failure");
        assert_eq!(
            extract_upstream_message(""),
            "upstream returned an error with no body"
        );
    }
}

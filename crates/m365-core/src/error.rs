use thiserror::Error;

/// Every failure the gateway can surface to a client, including upstream
/// passthrough. The OpenAI error body is derived from `code()`, `status()`
/// and `error_type()`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing or unresolvable authorization")]
    MissingAuthorization,

    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("unsupported transport: {0}")]
    InvalidTransport(String),

    #[error("unknown previous_response_id: {0}")]
    InvalidPreviousResponseId(String),

    #[error("{0}")]
    InvalidToolOutput(String),

    #[error("conversation id could not be resolved or created")]
    ConversationIdMissing,

    #[error("graph error ({status}): {message}")]
    Graph { status: u16, message: String },

    #[error("substrate error ({status}): {message}")]
    Substrate { status: u16, message: String },

    #[error("no stored response with id {0}")]
    ResponseNotFound(String),

    #[error("response id is required")]
    MissingResponseId,

    #[error("response stream error: {0}")]
    ResponseStreamError(String),

    #[error("upstream timeout: {0}")]
    Timeout(String),
}

impl ProxyError {
    /// Stable error code placed in `error.code` of the OpenAI error body.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::MissingAuthorization => "missing_authorization",
            ProxyError::InvalidJson(_) => "invalid_json",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::InvalidTransport(_) => "invalid_transport",
            ProxyError::InvalidPreviousResponseId(_) => "invalid_previous_response_id",
            ProxyError::InvalidToolOutput(_) => "invalid_tool_output",
            ProxyError::ConversationIdMissing => "conversation_id_missing",
            ProxyError::Graph { .. } => "graph_error",
            ProxyError::Substrate { .. } => "substrate_error",
            ProxyError::ResponseNotFound(_) => "response_not_found",
            ProxyError::MissingResponseId => "missing_response_id",
            ProxyError::ResponseStreamError(_) => "response_stream_error",
            ProxyError::Timeout(_) => "timeout",
        }
    }

    /// HTTP status for this error. Upstream statuses are clamped into
    /// 400..=599; anything else becomes 502.
    pub fn status(&self) -> u16 {
        match self {
            ProxyError::MissingAuthorization => 401,
            ProxyError::InvalidJson(_)
            | ProxyError::InvalidRequest(_)
            | ProxyError::InvalidTransport(_)
            | ProxyError::InvalidPreviousResponseId(_)
            | ProxyError::InvalidToolOutput(_)
            | ProxyError::ConversationIdMissing
            | ProxyError::MissingResponseId => 400,
            ProxyError::ResponseNotFound(_) => 404,
            ProxyError::Graph { status, .. } | ProxyError::Substrate { status, .. } => {
                clamp_upstream_status(*status)
            }
            ProxyError::ResponseStreamError(_) => 502,
            ProxyError::Timeout(_) => 504,
        }
    }

    /// OpenAI `error.type` field.
    pub fn error_type(&self) -> &'static str {
        if self.status() < 500 {
            "invalid_request_error"
        } else {
            "api_error"
        }
    }

    /// OpenAI-shaped error body.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "param": null,
                "code": self.code(),
            }
        })
    }
}

/// Upstream HTTP statuses pass through only when they are already an error
/// class; a 2xx/3xx that still failed becomes 502.
pub fn clamp_upstream_status(status: u16) -> u16 {
    if (400..=599).contains(&status) {
        status
    } else {
        502
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        assert_eq!(ProxyError::MissingAuthorization.status(), 401);
        assert_eq!(ProxyError::MissingAuthorization.code(), "missing_authorization");
        assert_eq!(ProxyError::ResponseNotFound("resp_x".into()).status(), 404);
        assert_eq!(ProxyError::Timeout("read timed out".into()).status(), 504);
        assert_eq!(
            ProxyError::InvalidToolOutput("no call".into()).code(),
            "invalid_tool_output"
        );
    }

    #[test]
    fn upstream_status_clamping() {
        assert_eq!(clamp_upstream_status(404), 404);
        assert_eq!(clamp_upstream_status(503), 503);
        assert_eq!(clamp_upstream_status(200), 502);
        assert_eq!(clamp_upstream_status(302), 502);
    }

    #[test]
    fn error_body_shape() {
        let body = ProxyError::InvalidRequest("messages must not be empty".into()).body();
        assert_eq!(body["error"]["code"], "invalid_request");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["param"].is_null());
        assert_eq!(body["error"]["message"], "messages must not be empty");
    }
}

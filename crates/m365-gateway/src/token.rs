//! Bearer credential resolution for upstream calls.
//!
//! Priority: the inbound Authorization header (unless config ignores it),
//! then a cached token with a fresh expiry, then the on-disk token file, and
//! finally one single-flight run of the external acquisition command. The
//! write lock serializes acquisition — a second concurrent caller awaits the
//! first result instead of spawning a duplicate subprocess.

use chrono::Utc;
use m365_core::config::ProxyConfig;
use m365_core::redact::redact_token;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Minimum remaining lifetime before a token is considered stale.
const EXPIRY_MARGIN_SECS: i64 = 60;
/// Assumed lifetime for tokens that carry no readable expiry.
const OPAQUE_TOKEN_LIFETIME_SECS: i64 = 300;

struct CachedToken {
    bearer: String,
    expires_at: i64,
}

impl CachedToken {
    fn fresh(&self, now: i64) -> bool {
        now + EXPIRY_MARGIN_SECS < self.expires_at
    }
}

pub struct TokenProvider {
    ignore_inbound: bool,
    file_path: Option<String>,
    command: Option<String>,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(cfg: &ProxyConfig) -> Self {
        Self {
            ignore_inbound: cfg.ignore_incoming_authorization_header,
            file_path: cfg.token_file_path.clone(),
            command: cfg.token_command.clone(),
            cached: RwLock::new(None),
        }
    }

    /// Resolve to a full `Bearer <token>` header value, or `None` when every
    /// path fails.
    pub async fn resolve(&self, inbound: Option<&str>) -> Option<String> {
        if let Some(header) = inbound {
            if !self.ignore_inbound && !header.trim().is_empty() {
                return Some(normalize_bearer(header));
            }
        }

        let now = Utc::now().timestamp();

        // fast path — read lock
        {
            let cached = self.cached.read().await;
            if let Some(ref c) = *cached {
                if c.fresh(now) {
                    return Some(c.bearer.clone());
                }
            }
        }

        // slow path — write lock; double-check after acquiring it
        let mut cached = self.cached.write().await;
        let now = Utc::now().timestamp();
        if let Some(ref c) = *cached {
            if c.fresh(now) {
                return Some(c.bearer.clone());
            }
        }

        if let Some(token) = self.read_token_file(now) {
            let bearer = token.bearer.clone();
            *cached = Some(token);
            return Some(bearer);
        }

        self.acquire().await?;
        let now = Utc::now().timestamp();
        let token = self.read_token_file(now)?;
        let bearer = token.bearer.clone();
        *cached = Some(token);
        Some(bearer)
    }

    fn read_token_file(&self, now: i64) -> Option<CachedToken> {
        let path = self.file_path.as_deref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let token = raw.trim();
        if token.is_empty() {
            return None;
        }
        let expires_at = m365_substrate::jwt::expiry_unix(token)
            .unwrap_or(now + OPAQUE_TOKEN_LIFETIME_SECS);
        if now + EXPIRY_MARGIN_SECS >= expires_at {
            debug!(token = %redact_token(token), "on-disk token is stale");
            return None;
        }
        Some(CachedToken {
            bearer: format!("Bearer {token}"),
            expires_at,
        })
    }

    async fn acquire(&self) -> Option<()> {
        let command = self.command.as_deref()?;
        info!("running token acquisition command");
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => Some(()),
            Ok(s) => {
                warn!(code = ?s.code(), "token acquisition command failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "token acquisition command could not be spawned");
                None
            }
        }
    }
}

pub fn normalize_bearer(header: &str) -> String {
    let trimmed = header.trim();
    if trimmed.to_ascii_lowercase().starts_with("bearer ") {
        trimmed.to_string()
    } else {
        format!("Bearer {trimmed}")
    }
}

/// Strip the scheme back off for transports that need the raw token.
pub fn raw_token(bearer: &str) -> &str {
    bearer
        .strip_prefix("Bearer ")
        .or_else(|| bearer.strip_prefix("bearer "))
        .unwrap_or(bearer)
}

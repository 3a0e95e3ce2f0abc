//! TTL-bounded map from scoped conversation keys to upstream conversation
//! ids.
//!
//! Keys are `"<transport>:<key>"` so Graph and Substrate conversations never
//! collide. Eviction is lazy — every read and write runs a purge pass — so
//! no background task is needed.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct ConversationEntry {
    conversation_id: String,
    expires_at: DateTime<Utc>,
}

pub struct ConversationStore {
    entries: DashMap<String, ConversationEntry>,
    /// Zero or negative means entries never expire.
    ttl_minutes: i64,
}

impl ConversationStore {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_minutes,
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        if self.ttl_minutes <= 0 {
            // effectively-infinite sentinel
            DateTime::<Utc>::MAX_UTC
        } else {
            Utc::now() + Duration::minutes(self.ttl_minutes)
        }
    }

    fn purge(&self) {
        let now = Utc::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn try_get(&self, key: &str) -> Option<String> {
        self.purge();
        self.entries.get(key).map(|e| e.conversation_id.clone())
    }

    /// Insert or replace; refreshes the TTL.
    pub fn set(&self, key: &str, conversation_id: &str) {
        self.purge();
        self.entries.insert(
            key.to_string(),
            ConversationEntry {
                conversation_id: conversation_id.to_string(),
                expires_at: self.expiry(),
            },
        );
    }

    #[cfg(test)]
    fn force_expire(&self, key: &str) {
        if let Some(mut e) = self.entries.get_mut(key) {
            e.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

//! TTL-bounded store of completed Responses-API bodies plus the
//! `responseId → conversationId` link table used by
//! `previous_response_id` continuation.
//!
//! Bodies are cloned on write and on read so callers can never mutate a
//! stored response through a returned handle.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

const LIST_DEFAULT_LIMIT: usize = 20;
const LIST_MAX_LIMIT: usize = 100;

#[derive(Debug, Clone)]
struct StoredResponse {
    created_at_unix: i64,
    /// Insertion order; breaks `created_at_unix` ties deterministically.
    seq: u64,
    body: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct LinkEntry {
    conversation_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ListPage {
    pub data: Vec<Value>,
    pub has_more: bool,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
}

pub struct ResponseStore {
    entries: DashMap<String, StoredResponse>,
    links: DashMap<String, LinkEntry>,
    seq: AtomicU64,
    ttl_minutes: i64,
}

impl ResponseStore {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            entries: DashMap::new(),
            links: DashMap::new(),
            seq: AtomicU64::new(0),
            ttl_minutes,
        }
    }

    fn expiry(&self) -> DateTime<Utc> {
        if self.ttl_minutes <= 0 {
            DateTime::<Utc>::MAX_UTC
        } else {
            Utc::now() + Duration::minutes(self.ttl_minutes)
        }
    }

    fn purge(&self) {
        let now = Utc::now();
        self.entries.retain(|_, e| e.expires_at > now);
        self.links.retain(|_, e| e.expires_at > now);
    }

    pub fn set(&self, response_id: &str, body: &Value, conversation_id: Option<&str>) {
        self.purge();
        let created_at_unix = body
            .get("created_at")
            .and_then(Value::as_i64)
            .unwrap_or_else(|| Utc::now().timestamp());
        self.entries.insert(
            response_id.to_string(),
            StoredResponse {
                created_at_unix,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
                body: body.clone(),
                expires_at: self.expiry(),
            },
        );
        if let Some(conv) = conversation_id {
            self.set_conversation_link(response_id, conv);
        }
    }

    pub fn try_get(&self, response_id: &str) -> Option<Value> {
        self.purge();
        self.entries.get(response_id).map(|e| e.body.clone())
    }

    pub fn try_delete(&self, response_id: &str) -> bool {
        self.purge();
        let removed = self.entries.remove(response_id).is_some();
        self.links.remove(response_id);
        removed
    }

    /// Newest-first page of stored bodies. Limits outside 1..=100 clamp to
    /// the default (20) below and the maximum (100) above.
    pub fn list(&self, limit: Option<i64>) -> ListPage {
        self.purge();
        let limit = match limit {
            Some(n) if n >= 1 && n <= LIST_MAX_LIMIT as i64 => n as usize,
            Some(n) if n > LIST_MAX_LIMIT as i64 => LIST_MAX_LIMIT,
            _ => LIST_DEFAULT_LIMIT,
        };

        let mut all: Vec<(i64, u64, Value)> = self
            .entries
            .iter()
            .map(|e| (e.created_at_unix, e.seq, e.body.clone()))
            .collect();
        all.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        let has_more = all.len() > limit;
        let data: Vec<Value> = all.into_iter().take(limit).map(|(_, _, b)| b).collect();
        let id_of = |v: &Value| v.get("id").and_then(Value::as_str).map(String::from);
        ListPage {
            first_id: data.first().and_then(id_of),
            last_id: data.last().and_then(id_of),
            has_more,
            data,
        }
    }

    pub fn set_conversation_link(&self, response_id: &str, conversation_id: &str) {
        self.links.insert(
            response_id.to_string(),
            LinkEntry {
                conversation_id: conversation_id.to_string(),
                expires_at: self.expiry(),
            },
        );
    }

    pub fn try_get_conversation_link(&self, response_id: &str) -> Option<String> {
        self.purge();
        self.links.get(response_id).map(|e| e.conversation_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(id: &str, created_at: i64) -> Value {
        json!({"id": id, "object": "response", "created_at": created_at, "output": []})
    }

    #[test]
    fn stored_bodies_round_trip_deep_equal() {
        let store = ResponseStore::new(60);
        let original = body("resp_1", 100);
        store.set("resp_1", &original, Some("conv-1"));
        let got = store.try_get("resp_1").unwrap();
        assert_eq!(got, original);
        assert_eq!(
            store.try_get_conversation_link("resp_1"),
            Some("conv-1".to_string())
        );
    }

    #[test]
    fn reads_return_clones() {
        let store = ResponseStore::new(60);
        store.set("resp_1", &body("resp_1", 100), None);
        let mut got = store.try_get("resp_1").unwrap();
        got["id"] = json!("tampered");
        assert_eq!(store.try_get("resp_1").unwrap()["id"], "resp_1");
    }

    #[test]
    fn delete_is_idempotent_in_outcome() {
        let store = ResponseStore::new(60);
        store.set("resp_1", &body("resp_1", 100), Some("conv-1"));
        assert!(store.try_delete("resp_1"));
        assert!(!store.try_delete("resp_1"));
        assert_eq!(store.try_get_conversation_link("resp_1"), None);
    }

    #[test]
    fn list_orders_newest_first_with_seq_tiebreak() {
        let store = ResponseStore::new(60);
        store.set("resp_a", &body("resp_a", 100), None);
        store.set("resp_b", &body("resp_b", 200), None);
        store.set("resp_c", &body("resp_c", 200), None);
        let page = store.list(Some(2));
        let ids: Vec<&str> = page
            .data
            .iter()
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        // same created_at: later insertion first
        assert_eq!(ids, vec!["resp_c", "resp_b"]);
        assert!(page.has_more);
        assert_eq!(page.first_id.as_deref(), Some("resp_c"));
        assert_eq!(page.last_id.as_deref(), Some("resp_b"));
    }

    #[test]
    fn list_limit_clamping() {
        let store = ResponseStore::new(60);
        for i in 0..25 {
            let id = format!("resp_{i}");
            store.set(&id, &body(&id, i), None);
        }
        assert_eq!(store.list(Some(0)).data.len(), 20);
        assert_eq!(store.list(Some(-3)).data.len(), 20);
        assert_eq!(store.list(None).data.len(), 20);
        assert_eq!(store.list(Some(1000)).data.len(), 25);
        assert_eq!(store.list(Some(5)).data.len(), 5);
    }
}

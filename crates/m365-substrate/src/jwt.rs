//! Just enough JWT handling to read claims out of a bearer token.
//! No signature verification — the upstream validates the token; this side
//! only needs routing claims and the expiry.

use base64::Engine;
use m365_core::json;
use serde_json::Value;

/// Tenant routing claims the hub URL is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub oid: String,
    pub tid: String,
}

fn payload_json(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// `oid` and `tid` from the token payload, or `None` when the bearer is not
/// a decodable JWT carrying both.
pub fn decode_claims(token: &str) -> Option<TokenClaims> {
    let payload = payload_json(token)?;
    Some(TokenClaims {
        oid: json::str_field(&payload, "oid")?.to_string(),
        tid: json::str_field(&payload, "tid")?.to_string(),
    })
}

/// `exp` claim as a unix timestamp.
pub fn expiry_unix(token: &str) -> Option<i64> {
    json::int_field(&payload_json(token)?, "exp")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jwt(payload: &Value) -> String {
        let enc = |v: &Value| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(serde_json::to_vec(v).unwrap())
        };
        format!(
            "{}.{}.sig",
            enc(&serde_json::json!({"alg": "RS256"})),
            enc(payload)
        )
    }

    #[test]
    fn decodes_oid_and_tid() {
        let token = make_jwt(&serde_json::json!({
            "oid": "user-1", "tid": "tenant-1", "exp": 1800000000,
        }));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.oid, "user-1");
        assert_eq!(claims.tid, "tenant-1");
        assert_eq!(expiry_unix(&token), Some(1800000000));
    }

    #[test]
    fn missing_claims_rejected() {
        let token = make_jwt(&serde_json::json!({"oid": "user-1"}));
        assert_eq!(decode_claims(&token), None);
    }

    #[test]
    fn opaque_token_rejected() {
        assert_eq!(decode_claims("not-a-jwt"), None);
        assert_eq!(decode_claims("a.%%%.c"), None);
        assert_eq!(expiry_unix(""), None);
    }
}

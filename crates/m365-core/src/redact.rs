//! Bearer-token redaction for anything that reaches logs.

/// `<first4>...<last3>`; tokens too short to keep either end are fully
/// masked.
pub fn redact_token(token: &str) -> String {
    let t = token.trim();
    if t.len() <= 8 || !t.is_ascii() {
        return "<redacted>".to_string();
    }
    format!("{}...{}", &t[..4], &t[t.len() - 3..])
}

/// Redact the `access_token` query parameter of a URL before logging it.
pub fn redact_url(url: &str) -> String {
    let Some(idx) = url.find("access_token=") else {
        return url.to_string();
    };
    let start = idx + "access_token=".len();
    let end = url[start..]
        .find('&')
        .map(|i| start + i)
        .unwrap_or(url.len());
    let mut out = String::with_capacity(url.len());
    out.push_str(&url[..start]);
    out.push_str(&redact_token(&url[start..end]));
    out.push_str(&url[end..]);
    out
}

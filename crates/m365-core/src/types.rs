use serde::{Deserialize, Serialize};

/// Upstream wire selection. `graph` is REST + SSE, `substrate` is the
/// RS-framed WebSocket hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Graph,
    Substrate,
}

impl Transport {
    /// Lowercase name — also the conversation-key scope prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Graph => "graph",
            Transport::Substrate => "substrate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "graph" => Some(Transport::Graph),
            "substrate" => Some(Transport::Substrate),
            _ => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Transport::parse("Graph"), Some(Transport::Graph));
        assert_eq!(Transport::parse(" SUBSTRATE "), Some(Transport::Substrate));
        assert_eq!(Transport::parse("teams"), None);
    }
}

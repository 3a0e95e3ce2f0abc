use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (m365-proxy.toml + M365_PROXY_* env overrides).
///
/// Key names are camelCase on the wire; that is the authoritative spelling
/// for both the TOML file and documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Bind address, e.g. "127.0.0.1:8134".
    pub listen_url: String,
    /// Default env-filter directive when RUST_LOG is unset.
    pub log_level: String,
    /// Default upstream transport: "graph" | "substrate".
    pub transport: String,

    pub graph_base_url: String,
    pub create_conversation_path: String,
    /// Contains the literal `{conversationId}` placeholder.
    pub chat_path_template: String,
    pub chat_over_stream_path_template: String,

    pub substrate: SubstrateConfig,

    pub default_model: String,
    pub default_time_zone: String,
    /// Zero or negative means conversations never expire.
    pub conversation_ttl_minutes: i64,
    pub max_additional_context_messages: usize,
    pub include_conversation_id_in_response_body: bool,
    pub ignore_incoming_authorization_header: bool,

    /// Token file written by the external acquisition command.
    pub token_file_path: Option<String>,
    /// Shell command that refreshes the token file.
    pub token_command: Option<String>,
}

/// Substrate hub settings. `optionsSets` and `allowedMessageTypes` are
/// authoritative as configured — the driver never hardcodes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubstrateConfig {
    /// Host + path of the hub, without scheme, e.g.
    /// "substrate.office.com/m365Copilot/Chathub".
    pub hub_path: String,
    pub source: String,
    /// Wrap the `source` query value in double quotes.
    pub quote_source_in_query: bool,
    pub scenario: String,
    pub origin: String,
    pub product: String,
    pub agent_host: String,
    pub license_type: String,
    pub agent: String,
    pub variants: String,
    pub client_platform: String,
    pub product_thread_type: String,
    pub invocation_timeout_seconds: u64,
    pub keep_alive_seconds: u64,
    pub options_sets: Vec<String>,
    pub allowed_message_types: Vec<String>,
    pub invocation_target: String,
    pub invocation_type: i64,
    pub locale: String,
    pub experience_type: String,
    pub entity_annotation_types: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_url: "127.0.0.1:8134".to_string(),
            log_level: "m365_gateway=info,tower_http=warn".to_string(),
            transport: "graph".to_string(),
            graph_base_url: "https://graph.microsoft.com".to_string(),
            create_conversation_path: "/beta/copilot/conversations".to_string(),
            chat_path_template: "/beta/copilot/conversations/{conversationId}/chat".to_string(),
            chat_over_stream_path_template:
                "/beta/copilot/conversations/{conversationId}/chatOverStream".to_string(),
            substrate: SubstrateConfig::default(),
            default_model: "m365-copilot".to_string(),
            default_time_zone: "UTC".to_string(),
            conversation_ttl_minutes: 120,
            max_additional_context_messages: 16,
            include_conversation_id_in_response_body: false,
            ignore_incoming_authorization_header: false,
            token_file_path: None,
            token_command: None,
        }
    }
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            hub_path: "substrate.office.com/m365Copilot/Chathub".to_string(),
            source: "officeweb".to_string(),
            quote_source_in_query: false,
            scenario: "officeweb".to_string(),
            origin: "https://www.office.com".to_string(),
            product: String::new(),
            agent_host: String::new(),
            license_type: String::new(),
            agent: String::new(),
            variants: String::new(),
            client_platform: "web".to_string(),
            product_thread_type: "Office".to_string(),
            invocation_timeout_seconds: 120,
            keep_alive_seconds: 15,
            options_sets: Vec::new(),
            allowed_message_types: Vec::new(),
            invocation_target: "chat".to_string(),
            invocation_type: 4,
            locale: "en-US".to_string(),
            experience_type: "Default".to_string(),
            entity_annotation_types: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load config from a TOML file with M365_PROXY_* env var overrides.
    ///
    /// Env keys keep the camelCase spelling and use `__` for nesting, e.g.
    /// `M365_PROXY_defaultModel` or `M365_PROXY_substrate__hubPath`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ./m365-proxy.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("m365-proxy.toml");

        let config: ProxyConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("M365_PROXY_").split("__").lowercase(false))
            .extract()
            .map_err(|e| crate::error::ProxyError::InvalidRequest(format!("config: {e}")))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.default_model, "m365-copilot");
        assert_eq!(cfg.default_time_zone, "UTC");
        assert_eq!(cfg.conversation_ttl_minutes, 120);
        assert_eq!(cfg.max_additional_context_messages, 16);
        assert_eq!(cfg.substrate.invocation_timeout_seconds, 120);
        assert_eq!(cfg.substrate.keep_alive_seconds, 15);
        assert!(cfg.substrate.options_sets.is_empty());
    }

    #[test]
    fn camel_case_keys_round_trip() {
        let json = serde_json::to_value(ProxyConfig::default()).unwrap();
        assert!(json.get("listenUrl").is_some());
        assert!(json.get("graphBaseUrl").is_some());
        assert!(json.get("conversationTtlMinutes").is_some());
        assert!(json["substrate"].get("invocationTimeoutSeconds").is_some());
        assert!(json["substrate"].get("allowedMessageTypes").is_some());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "m365-proxy.toml",
                r#"
                    defaultModel = "copilot-lab"
                    [substrate]
                    keepAliveSeconds = 5
                "#,
            )?;
            let cfg = ProxyConfig::load(None).unwrap();
            assert_eq!(cfg.default_model, "copilot-lab");
            assert_eq!(cfg.substrate.keep_alive_seconds, 5);
            // untouched keys keep their defaults
            assert_eq!(cfg.substrate.invocation_timeout_seconds, 120);
            Ok(())
        });
    }
}

//! Client configuration and endpoint resolution.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthCallback, TokenDetails, TokenParams};
use crate::transport::Dialer;

pub(crate) const DEFAULT_REST_HOST: &str = "rest.ably.io";
pub(crate) const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";
pub(crate) const PROTOCOL_VERSION: &str = "1.2";
pub(crate) const AGENT_STRING: &str = "ably-client-rs/0.1";

pub(crate) const PROTOCOL_JSON: &str = "application/json";
pub(crate) const PROTOCOL_MSGPACK: &str = "application/x-msgpack";

pub(crate) fn default_fallback_hosts() -> Vec<String> {
    vec![
        "a.ably-realtime.com".to_string(),
        "b.ably-realtime.com".to_string(),
        "c.ably-realtime.com".to_string(),
        "d.ably-realtime.com".to_string(),
        "e.ably-realtime.com".to_string(),
    ]
}

/// Configuration for [`Rest`](crate::Rest) and [`Realtime`](crate::Realtime)
/// clients. Construct with [`ClientOptions::new`] and set fields directly.
pub struct ClientOptions {
    // --- authentication ---
    /// API key of the form `"<keyName>:<keySecret>"`.
    pub key: Option<String>,
    /// Literal token string to authenticate with.
    pub token: Option<String>,
    /// Full token details to authenticate with.
    pub token_details: Option<TokenDetails>,
    /// Callback that produces a token request, token details, or token string.
    pub auth_callback: Option<AuthCallback>,
    /// URL queried to obtain a token request or token details.
    pub auth_url: Option<String>,
    /// HTTP method used against `auth_url`.
    pub auth_method: reqwest::Method,
    /// Extra headers for `auth_url` requests.
    pub auth_headers: Vec<(String, String)>,
    /// Extra query parameters for `auth_url` requests.
    pub auth_params: Vec<(String, String)>,
    /// Force token auth even when a key is available.
    pub use_token_auth: bool,
    /// Sign token requests with server time instead of the local clock.
    pub use_query_time: bool,
    /// Token params applied when a request doesn't specify its own.
    pub default_token_params: Option<TokenParams>,

    // --- endpoints ---
    /// Environment prefix for the default hosts (`sandbox` →
    /// `sandbox-rest.ably.io`).
    pub environment: Option<String>,
    pub rest_host: Option<String>,
    pub realtime_host: Option<String>,
    pub port: u16,
    pub tls_port: u16,
    pub tls: bool,
    /// Overrides the default fallback host list. `Some(vec![])` disables
    /// fallback entirely.
    pub fallback_hosts: Option<Vec<String>>,
    /// How long a successful fallback host is preferred before retrying the
    /// primary.
    pub fallback_retry_timeout: Duration,

    // --- behavior ---
    /// Client id for presence and identified publishes.
    pub client_id: Option<String>,
    /// Receive messages this connection published.
    pub echo_messages: bool,
    /// Queue publishes while the connection is down instead of failing them.
    pub queue_messages: bool,
    /// Connect as soon as the realtime client is created.
    pub auto_connect: bool,
    /// Recovery key from a previous connection, as produced by
    /// `Connection::recovery_key`.
    pub recover: Option<String>,
    /// Extra query parameters for the realtime transport URL.
    pub transport_params: Vec<(String, String)>,
    /// Use MessagePack framing instead of JSON.
    pub binary_protocol: bool,
    /// Assign deterministic ids to REST publishes so server-side retries
    /// deduplicate.
    pub idempotent_rest_publishing: bool,

    // --- timeouts ---
    pub http_request_timeout: Duration,
    pub http_open_timeout: Duration,
    /// Maximum number of fallback hosts to try per REST request.
    pub http_max_retry_count: usize,
    /// Bounds every individual realtime request (connect, attach, detach,
    /// close).
    pub realtime_request_timeout: Duration,
    pub disconnected_retry_timeout: Duration,
    pub suspended_retry_timeout: Duration,
    pub channel_retry_timeout: Duration,
    /// How long a disconnected session remains resumable.
    pub connection_state_ttl: Duration,

    /// Custom realtime transport factory. Defaults to the built-in
    /// WebSocket dialer.
    pub dialer: Option<Arc<dyn Dialer>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            key: None,
            token: None,
            token_details: None,
            auth_callback: None,
            auth_url: None,
            auth_method: reqwest::Method::GET,
            auth_headers: Vec::new(),
            auth_params: Vec::new(),
            use_token_auth: false,
            use_query_time: false,
            default_token_params: None,
            environment: None,
            rest_host: None,
            realtime_host: None,
            port: 80,
            tls_port: 443,
            tls: true,
            fallback_hosts: None,
            fallback_retry_timeout: Duration::from_secs(10 * 60),
            client_id: None,
            echo_messages: true,
            queue_messages: true,
            auto_connect: true,
            recover: None,
            transport_params: Vec::new(),
            binary_protocol: true,
            idempotent_rest_publishing: false,
            http_request_timeout: Duration::from_secs(10),
            http_open_timeout: Duration::from_secs(4),
            http_max_retry_count: 3,
            realtime_request_timeout: Duration::from_secs(10),
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            channel_retry_timeout: Duration::from_secs(15),
            connection_state_ttl: Duration::from_secs(120),
            dialer: None,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for options authenticated with an API key.
    pub fn with_key(key: impl Into<String>) -> Self {
        ClientOptions {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// The key name portion of `key`, if set.
    pub fn key_name(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| k.split_once(':')).map(|(name, _)| name)
    }

    /// The key secret portion of `key`, if set.
    pub fn key_secret(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| k.split_once(':')).map(|(_, secret)| secret)
    }

    pub(crate) fn primary_rest_host(&self) -> String {
        resolve_host(self.rest_host.as_deref(), self.environment.as_deref(), DEFAULT_REST_HOST)
    }

    pub(crate) fn primary_realtime_host(&self) -> String {
        resolve_host(
            self.realtime_host.as_deref(),
            self.environment.as_deref(),
            DEFAULT_REALTIME_HOST,
        )
    }

    pub(crate) fn active_port(&self) -> u16 {
        if self.tls {
            self.tls_port
        } else {
            self.port
        }
    }

    /// REST base URL for the given host.
    pub(crate) fn rest_url(&self, host: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{host}:{}", self.active_port())
    }

    /// Realtime URL for the given host, without query parameters.
    pub(crate) fn realtime_url(&self, host: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{host}:{}/", self.active_port())
    }

    pub(crate) fn fallback_host_list(&self) -> Vec<String> {
        match &self.fallback_hosts {
            Some(hosts) => hosts.clone(),
            None => default_fallback_hosts(),
        }
    }

    pub(crate) fn protocol(&self) -> &'static str {
        if self.binary_protocol {
            PROTOCOL_MSGPACK
        } else {
            PROTOCOL_JSON
        }
    }

    /// Token params with the default TTL applied.
    pub(crate) fn token_params_or_default(&self) -> TokenParams {
        self.default_token_params.clone().unwrap_or_else(|| TokenParams {
            ttl: Some(60 * 60 * 1000),
            ..TokenParams::default()
        })
    }
}

/// Environment prefixing applies only to the default hosts, and `production`
/// means no prefix.
fn resolve_host(host: Option<&str>, environment: Option<&str>, default_host: &str) -> String {
    let host = host.unwrap_or(default_host);
    match environment {
        Some(env) if host == default_host && !env.is_empty() && env != "production" => {
            format!("{env}-{host}")
        }
        _ => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_hosts() {
        let opts = ClientOptions::new();
        assert_eq!(opts.primary_rest_host(), "rest.ably.io");
        assert_eq!(opts.primary_realtime_host(), "realtime.ably.io");
    }

    #[test]
    fn environment_prefixes_default_hosts() {
        let mut opts = ClientOptions::new();
        opts.environment = Some("sandbox".into());
        assert_eq!(opts.primary_rest_host(), "sandbox-rest.ably.io");
        assert_eq!(opts.primary_realtime_host(), "sandbox-realtime.ably.io");
    }

    #[test]
    fn production_environment_is_no_prefix() {
        let mut opts = ClientOptions::new();
        opts.environment = Some("production".into());
        assert_eq!(opts.primary_rest_host(), "rest.ably.io");
    }

    #[test]
    fn environment_does_not_prefix_custom_host() {
        let mut opts = ClientOptions::new();
        opts.environment = Some("sandbox".into());
        opts.rest_host = Some("rest.example.com".into());
        assert_eq!(opts.primary_rest_host(), "rest.example.com");
    }

    #[test]
    fn rest_url_respects_tls() {
        let mut opts = ClientOptions::new();
        assert_eq!(opts.rest_url("rest.ably.io"), "https://rest.ably.io:443");
        opts.tls = false;
        assert_eq!(opts.rest_url("rest.ably.io"), "http://rest.ably.io:80");
    }

    #[test]
    fn realtime_url_respects_tls_port() {
        let mut opts = ClientOptions::new();
        opts.tls_port = 8443;
        assert_eq!(opts.realtime_url("realtime.ably.io"), "wss://realtime.ably.io:8443/");
    }

    #[test]
    fn key_name_and_secret() {
        let opts = ClientOptions::with_key("appId.keyId:secret");
        assert_eq!(opts.key_name(), Some("appId.keyId"));
        assert_eq!(opts.key_secret(), Some("secret"));
        assert_eq!(ClientOptions::new().key_name(), None);
    }

    #[test]
    fn fallback_hosts_default_and_override() {
        let opts = ClientOptions::new();
        assert_eq!(opts.fallback_host_list().len(), 5);
        let mut opts = ClientOptions::new();
        opts.fallback_hosts = Some(vec![]);
        assert!(opts.fallback_host_list().is_empty());
    }
}

use std::time::Duration;

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// Front-end origins allowed to open a gateway connection. `*` allows any.
    pub allowed_origins: Vec<String>,
    /// HS256 secret the auth service signs identity tokens with. When unset,
    /// connections can never identify and stay anonymous.
    pub identity_secret: Option<String>,
    /// Bearer secret the request-handling layer presents to push notifications.
    /// When unset, the HTTP bridge endpoint rejects every call.
    pub bridge_secret: Option<String>,
    /// Endpoint of the external store that accepts relayed chat messages.
    pub message_sink_url: Option<String>,
    /// Connections with no inbound frame for this long are dropped.
    pub idle_timeout: Duration,
    /// Interval between server-initiated WebSocket pings.
    pub ping_interval: Duration,
    /// A typing indicator expires this long after the last `typing` event.
    pub typing_ttl: Duration,
    /// A user is reported offline this long after their last connection closed.
    pub presence_grace: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Capacity of the hub's command queue.
    pub hub_queue: usize,
    /// Upper bound on how long a bridge notify may wait for queue space.
    pub bridge_send_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unparsable values fall back to the default.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT").unwrap_or(4003),
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .ok()
                .map(|v| parse_origins(&v))
                .unwrap_or_else(|| vec!["http://localhost:3000".to_string()]),
            identity_secret: optional_var("IDENTITY_SECRET"),
            bridge_secret: optional_var("BRIDGE_SECRET"),
            message_sink_url: optional_var("MESSAGE_SINK_URL"),
            idle_timeout: Duration::from_secs(parsed_var("IDLE_TIMEOUT_SECS").unwrap_or(120)),
            ping_interval: Duration::from_secs(parsed_var("PING_INTERVAL_SECS").unwrap_or(30)),
            typing_ttl: Duration::from_millis(parsed_var("TYPING_TTL_MS").unwrap_or(5000)),
            presence_grace: Duration::from_secs(parsed_var("PRESENCE_GRACE_SECS").unwrap_or(10)),
            outbound_buffer: parsed_var("OUTBOUND_BUFFER").unwrap_or(256).max(1),
            hub_queue: parsed_var("HUB_QUEUE").unwrap_or(1024).max(1),
            bridge_send_timeout: Duration::from_millis(
                parsed_var("BRIDGE_SEND_TIMEOUT_MS").unwrap_or(250),
            ),
        }
    }

    /// Whether a browser `Origin` header value may open a connection.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        let origin = origin.trim_end_matches('/');
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4003,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            identity_secret: None,
            bridge_secret: None,
            message_sink_url: None,
            idle_timeout: Duration::from_secs(120),
            ping_interval: Duration::from_secs(30),
            typing_ttl: Duration::from_millis(5000),
            presence_grace: Duration::from_secs(10),
            outbound_buffer: 256,
            hub_queue: 1024,
            bridge_send_timeout: Duration::from_millis(250),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

use std::env;
use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::TransportError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(1_500);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FALLBACK_PORT_OFFSET: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Ws,
    Wss,
    Tcp,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Tcp => "tcp",
        }
    }
}

/// A parsed agent address. `host:port` without a scheme means WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let trimmed = raw.trim();
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ws://{trimmed}")
        };
        let invalid = || TransportError::InvalidEndpoint(raw.to_string());
        let url = Url::parse(&candidate).map_err(|_| invalid())?;
        let scheme = match url.scheme() {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            "tcp" => Scheme::Tcp,
            _ => return Err(invalid()),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        let port = url.port_or_known_default().ok_or_else(invalid)?;
        let path = match url.path() {
            "" | "/" => String::new(),
            path => path.to_string(),
        };
        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Byte-stream endpoints need the scanning decoder and may fall back to
    /// WebSocket.
    pub fn is_byte_stream(&self) -> bool {
        self.scheme == Scheme::Tcp
    }

    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.path
        )
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The WebSocket endpoint tried once when a raw TCP connect fails.
    pub fn websocket_fallback(&self, port_offset: u16) -> Option<Endpoint> {
        if !self.is_byte_stream() {
            return None;
        }
        let port = self.port.checked_add(port_offset)?;
        Some(Endpoint {
            scheme: Scheme::Ws,
            host: self.host.clone(),
            port,
            path: String::new(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the 1-based `attempt`: base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    /// `None` disables the TCP to WebSocket fallback.
    pub fallback_port_offset: Option<u16>,
    /// Append `\n` to outbound WebSocket frames for newline-delimited peers.
    pub ws_newline_terminated: bool,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            fallback_port_offset: Some(DEFAULT_FALLBACK_PORT_OFFSET),
            ws_newline_terminated: false,
        }
    }

    /// Reads `PIER_*` overrides. `endpoint` wins over `PIER_ENDPOINT` when
    /// given.
    pub fn from_env(endpoint: Option<&str>) -> Result<Self, TransportError> {
        let raw = match endpoint {
            Some(raw) => raw.to_string(),
            None => env::var("PIER_ENDPOINT").unwrap_or_else(|_| "ws://127.0.0.1:8765".into()),
        };
        let mut config = Self::new(Endpoint::parse(&raw)?);
        if let Some(max_retries) = parse_env("PIER_MAX_RETRIES") {
            config.retry.max_retries = max_retries;
        }
        if let Some(base_ms) = parse_env::<u64>("PIER_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(base_ms);
        }
        if let Some(timeout_ms) = parse_env::<u64>("PIER_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = Duration::from_millis(timeout_ms);
        }
        match env::var("PIER_FALLBACK_PORT_OFFSET").ok().as_deref() {
            Some("off" | "none") => config.fallback_port_offset = None,
            Some(value) => {
                if let Ok(offset) = value.parse() {
                    config.fallback_port_offset = Some(offset);
                }
            }
            None => {}
        }
        config.ws_newline_terminated = env::var("PIER_WS_NEWLINE")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Ok(config)
    }

    /// Key under which cached sessions and transcripts are stored.
    pub fn server_key(&self) -> String {
        self.endpoint.url()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

use thiserror::Error;

/// Failure classes the gateway reacts to differently.
///
/// Setup errors are fatal to a call and never retried. Connectivity and
/// rate-limit errors are retried with backoff. Authentication and
/// configuration errors are always fatal. Protocol desync is recovered
/// locally by the session and only escalates to a reconnect.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("port pool exhausted")]
    PoolExhausted,

    #[error("invalid call parameters: {0}")]
    InvalidParams(String),

    #[error("unknown call {0}")]
    UnknownCall(String),

    #[error("switch operation {op} failed: {reason}")]
    Switch { op: String, reason: String },

    #[error("realtime authentication failed: {0}")]
    Authentication(String),

    #[error("realtime rate limited: {0}")]
    RateLimited(String),

    #[error("realtime connection error: {0}")]
    Connectivity(String),

    #[error("realtime protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("realtime handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl GatewayError {
    pub fn switch(op: &str, reason: impl ToString) -> Self {
        GatewayError::Switch {
            op: op.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Connectivity(_)
                | GatewayError::RateLimited(_)
                | GatewayError::HandshakeTimeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, GatewayError::ProtocolDesync(_))
    }

    /// Classify an `error` event reported by the realtime backend.
    pub fn from_backend(code: Option<&str>, kind: Option<&str>, message: &str) -> Self {
        let code = code.unwrap_or_default();
        let kind = kind.unwrap_or_default();
        let lower = message.to_ascii_lowercase();

        if code == "input_audio_buffer_commit_empty"
            || lower.contains("buffer too small")
            || (lower.contains("commit") && lower.contains("buffer") && lower.contains("empty"))
        {
            return GatewayError::ProtocolDesync(message.to_string());
        }
        if kind == "authentication_error"
            || code == "invalid_api_key"
            || code == "unauthorized"
            || lower.contains("incorrect api key")
        {
            return GatewayError::Authentication(message.to_string());
        }
        if code == "rate_limit_exceeded"
            || code == "insufficient_quota"
            || kind == "rate_limit_error"
            || lower.contains("rate limit")
            || lower.contains("quota")
        {
            return GatewayError::RateLimited(message.to_string());
        }
        GatewayError::Connectivity(message.to_string())
    }

    /// Classify a failed connection attempt by its HTTP status, if any.
    pub fn from_connect_error(status: Option<u16>, message: &str) -> Self {
        match status {
            Some(401) | Some(403) => GatewayError::Authentication(message.to_string()),
            Some(429) => GatewayError::RateLimited(message.to_string()),
            _ => GatewayError::Connectivity(message.to_string()),
        }
    }
}

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_response_bytes: usize,
    pub http_max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retry_after_cap_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            request_timeout_ms: 60_000,
            max_response_bytes: 10_000_000,
            http_max_retries: 2,
            initial_backoff_ms: 200,
            max_backoff_ms: 1500,
            retry_after_cap_ms: 10_000,
        }
    }
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    Connection,
    Timeout,
    RateLimit,
    Server,
    Client,
    Parse,
    PayloadTooLarge,
    Unauthorized,
    Other,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub max_attempts: u32,
    pub kind: UpstreamErrorKind,
    pub status: Option<u16>,
    pub backoff_ms: u64,
}

/// Chat-backend failure after the retry budget is spent. Unlike tool
/// failures this crosses the agent loop as an error value, never as an
/// envelope.
#[derive(Debug)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub attempt: u32,
    pub max_attempts: u32,
    pub message: String,
    pub retries: Vec<RetryRecord>,
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "upstream {:?} error (attempt {}/{}): {}",
            self.kind, self.attempt, self.max_attempts, self.message
        )
    }
}

impl std::error::Error for UpstreamError {}

#[derive(Debug, Clone, Copy)]
pub struct ClassifiedError {
    pub kind: UpstreamErrorKind,
    pub retryable: bool,
    pub status: Option<u16>,
}

pub fn classify_status(status: u16) -> ClassifiedError {
    match status {
        429 => ClassifiedError {
            kind: UpstreamErrorKind::RateLimit,
            retryable: true,
            status: Some(status),
        },
        401 | 403 => ClassifiedError {
            kind: UpstreamErrorKind::Unauthorized,
            retryable: false,
            status: Some(status),
        },
        400 | 404 => ClassifiedError {
            kind: UpstreamErrorKind::Client,
            retryable: false,
            status: Some(status),
        },
        500..=599 => ClassifiedError {
            kind: UpstreamErrorKind::Server,
            retryable: true,
            status: Some(status),
        },
        _ => ClassifiedError {
            kind: UpstreamErrorKind::Other,
            retryable: false,
            status: Some(status),
        },
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> ClassifiedError {
    if err.is_timeout() {
        return ClassifiedError {
            kind: UpstreamErrorKind::Timeout,
            retryable: true,
            status: None,
        };
    }
    if err.is_connect() {
        return ClassifiedError {
            kind: UpstreamErrorKind::Connection,
            retryable: true,
            status: None,
        };
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16());
    }
    ClassifiedError {
        kind: UpstreamErrorKind::Other,
        retryable: false,
        status: None,
    }
}

pub fn deterministic_backoff_ms(cfg: HttpConfig, retry_index: u32) -> u64 {
    let factor = 1u64 << retry_index.min(16);
    let ms = cfg.initial_backoff_ms.saturating_mul(factor);
    ms.min(cfg.max_backoff_ms)
}

/// Server-provided Retry-After (integer or fractional seconds) wins over
/// the computed backoff, capped so a hostile header cannot stall the run.
pub fn retry_after_ms(cfg: HttpConfig, header: Option<&str>) -> Option<u64> {
    let raw = header?.trim();
    let secs: f64 = raw.parse().ok()?;
    if !(secs > 0.0) {
        return None;
    }
    Some(((secs * 1000.0) as u64).min(cfg.retry_after_cap_ms))
}

pub fn message_short(s: &str) -> String {
    let single_line = s
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>();
    let trimmed = single_line.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

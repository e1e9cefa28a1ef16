use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownTool,
    ValidationError,
    RateLimited,
    Timeout,
    ExecutionError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownTool => "unknown_tool",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::Timeout => "timeout",
            ErrorCode::ExecutionError => "execution_error",
        }
    }

    /// Only transient conditions are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::RateLimited | ErrorCode::Timeout)
    }
}

/// Classified tool failure. Travels inside an [`Envelope`], never as a Rust
/// error across the executor boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_retryable(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorCode::UnknownTool, format!("unknown tool: {name}"))
    }

    pub fn rate_limited(tool: &str, limit_per_min: u32) -> Self {
        Self::new(
            ErrorCode::RateLimited,
            format!("rate limit exceeded for {tool}: {limit_per_min}/min"),
        )
    }

    pub fn timeout(tool: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("{tool} exceeded {timeout_ms}ms deadline"),
        )
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ToolError {}

/// Uniform per-call result wrapper. `ok` and the result/error fields are
/// kept mutually consistent by construction; the only ways to build one are
/// [`Envelope::success`] and [`Envelope::failure`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub tool: String,
    pub ok: bool,
    pub duration_ms: u64,
    pub input_bytes: u64,
    pub result_bytes: u64,
    pub attempts: u32,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl Envelope {
    pub fn success(tool: &str, result: Value, stats: CallStats) -> Self {
        let result_bytes = json_size(&result);
        Self {
            schema_version: SCHEMA_VERSION,
            tool: tool.to_string(),
            ok: true,
            duration_ms: stats.duration_ms,
            input_bytes: stats.input_bytes,
            result_bytes,
            attempts: stats.attempts,
            cached: stats.cached,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(tool: &str, error: ToolError, stats: CallStats) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tool: tool.to_string(),
            ok: false,
            duration_ms: stats.duration_ms,
            input_bytes: stats.input_bytes,
            result_bytes: 0,
            attempts: stats.attempts,
            cached: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

/// Per-call accounting collected by the executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallStats {
    pub duration_ms: u64,
    pub input_bytes: u64,
    pub attempts: u32,
    pub cached: bool,
}

/// Serialized size of a value, for envelope accounting.
pub fn json_size(value: &Value) -> u64 {
    serde_json::to_string(value).map(|s| s.len() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn stats() -> CallStats {
        CallStats {
            duration_ms: 12,
            input_bytes: 30,
            attempts: 1,
            cached: false,
        }
    }

    #[test]
    fn success_and_failure_keep_ok_consistent() {
        let ok = Envelope::success("echo", json!({"text": "hi"}), stats());
        assert!(ok.ok && ok.result.is_some() && ok.error.is_none());
        assert_eq!(ok.result_bytes, json_size(&json!({"text": "hi"})));

        let err = Envelope::failure("echo", ToolError::unknown_tool("echo"), stats());
        assert!(!err.ok && err.result.is_none() && err.error.is_some());
        assert_eq!(err.result_bytes, 0);
        assert!(!err.cached);
    }

    #[test]
    fn retryable_flag_tracks_code() {
        assert!(ToolError::timeout("echo", 100).retryable);
        assert!(ToolError::rate_limited("echo", 5).retryable);
        assert!(!ToolError::new(ErrorCode::ExecutionError, "boom").retryable);
        assert!(!ToolError::unknown_tool("x").retryable);
    }

    #[test]
    fn wire_shape_uses_snake_case_codes() {
        let env = Envelope::failure(
            "echo",
            ToolError::new(ErrorCode::ValidationError, "bad args")
                .with_details(json!({"unknown_args": ["foo"]})),
            stats(),
        );
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["error"]["code"], "validation_error");
        assert_eq!(wire["error"]["details"]["unknown_args"], json!(["foo"]));
        assert!(wire.get("result").is_none());
    }
}

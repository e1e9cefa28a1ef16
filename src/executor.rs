use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::envelope::{json_size, CallStats, Envelope, ErrorCode, ToolError};
use crate::events::{Event, EventSink};
use crate::policy::PolicyGate;
use crate::ratelimit::RateLimiter;
use crate::registry::{ToolRegistry, ToolSpec};
use crate::types::CallContext;
use crate::validate::validate_args;

const RETRY_BACKOFF_BASE_MS: u64 = 50;
const RETRY_BACKOFF_CAP_MS: u64 = 1000;

/// Deterministic doubling backoff for retryable tool failures.
fn retry_backoff_ms(retry_index: u32) -> u64 {
    let shift = retry_index.min(16);
    (RETRY_BACKOFF_BASE_MS << shift).min(RETRY_BACKOFF_CAP_MS)
}

struct CacheEntry {
    expires_at: Instant,
    value: Value,
}

/// Runs tool calls end to end: policy gate, validation, cache, rate limit,
/// deadline, bounded retries. Every call produces exactly one [`Envelope`];
/// failures are values inside it, never Rust errors.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    limiter: Arc<RateLimiter>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    sink: Mutex<Box<dyn EventSink>>,
    run_id: String,
    step: AtomicU32,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        limiter: Arc<RateLimiter>,
        sink: Box<dyn EventSink>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            limiter,
            cache: Mutex::new(HashMap::new()),
            sink: Mutex::new(sink),
            run_id: run_id.into(),
            step: AtomicU32::new(0),
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Telemetry is fire-and-forget; emission failures never surface.
    /// The agent loop shares this stream for its lifecycle events.
    pub fn emit(&self, kind: &str, data: Value) {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        let event = Event::now(&self.run_id, step, kind, data);
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.emit(&event);
        }
    }

    fn finish(&self, envelope: Envelope) -> Envelope {
        let data = serde_json::to_value(&envelope).unwrap_or(Value::Null);
        self.emit("tool.envelope", data);
        envelope
    }

    pub async fn execute(&self, tool: &str, raw_args: Value, ctx: &CallContext) -> Envelope {
        let started = Instant::now();
        let raw_input_bytes = json_size(&raw_args);

        let spec = match self.registry.get(tool) {
            Some(spec) => spec,
            None => {
                return self.finish(Envelope::failure(
                    tool,
                    ToolError::unknown_tool(tool),
                    CallStats {
                        duration_ms: elapsed_ms(started),
                        input_bytes: raw_input_bytes,
                        attempts: 1,
                        cached: false,
                    },
                ))
            }
        };

        if let PolicyGate::Denied(reason) = ctx.policy.gate(&spec) {
            let error = ToolError::new(
                ErrorCode::ExecutionError,
                format!("{tool} is blocked by policy"),
            )
            .with_details(json!({ "blocked_reason": reason.as_str() }));
            return self.finish(fail_fast(tool, error, started, raw_input_bytes));
        }

        if ctx.policy.needs_approval(&spec) {
            let error = ToolError::new(
                ErrorCode::ExecutionError,
                format!("{tool} requires approval before it can run"),
            )
            .with_details(json!({ "approval_required": true }));
            return self.finish(fail_fast(tool, error, started, raw_input_bytes));
        }

        // Dry-run short-circuits anything that would mutate state.
        if ctx.policy.dry_run && !spec.read_only {
            return self.finish(Envelope::success(
                tool,
                json!({ "dry_run": true, "skipped": true }),
                CallStats {
                    duration_ms: elapsed_ms(started),
                    input_bytes: raw_input_bytes,
                    attempts: 1,
                    cached: false,
                },
            ));
        }

        let args = match validate_args(&spec.schema, &raw_args, ctx) {
            Ok(args) => args,
            Err(error) => {
                return self.finish(fail_fast(tool, error, started, raw_input_bytes))
            }
        };
        let input_bytes = json_size(&args);

        let cache_ttl = ctx.policy.effective_cache_ttl(&spec);
        let cache_key = if cache_ttl > Duration::ZERO {
            Some(cache_key(tool, &args))
        } else {
            None
        };
        if let Some(key) = &cache_key {
            if let Some(value) = self.cache_lookup(key) {
                return self.finish(Envelope::success(
                    tool,
                    value,
                    CallStats {
                        duration_ms: elapsed_ms(started),
                        input_bytes,
                        attempts: 1,
                        cached: true,
                    },
                ));
            }
        }

        let (outcome, attempts) = self.run_attempts(&spec, &args, ctx).await;
        let stats = CallStats {
            duration_ms: elapsed_ms(started),
            input_bytes,
            attempts,
            cached: false,
        };
        match outcome {
            Ok(value) => {
                if let (Some(key), ttl) = (cache_key, cache_ttl) {
                    self.cache_store(key, &value, ttl);
                }
                self.finish(Envelope::success(tool, value, stats))
            }
            Err(error) => self.finish(Envelope::failure(tool, error, stats)),
        }
    }

    /// One handler invocation per attempt, under the effective deadline.
    /// Only retryable failures (timeout, rate_limited) consume the retry
    /// budget; anything else stops immediately.
    async fn run_attempts(
        &self,
        spec: &ToolSpec,
        args: &Value,
        ctx: &CallContext,
    ) -> (Result<Value, ToolError>, u32) {
        let timeout = ctx.policy.effective_timeout(spec);
        let rate_limit = ctx.policy.effective_rate_limit(spec);
        let max_attempts = 1 + ctx.policy.effective_retries(spec);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = if !self.limiter.check(&spec.name, rate_limit) {
                ToolError::rate_limited(&spec.name, rate_limit)
            } else {
                match tokio::time::timeout(timeout, spec.handler.run(args.clone(), ctx)).await {
                    Ok(Ok(value)) => return (Ok(value), attempt),
                    Ok(Err(err)) => {
                        ToolError::new(ErrorCode::ExecutionError, format!("{err:#}"))
                    }
                    // The handler future is dropped here, cancelling it.
                    Err(_) => ToolError::timeout(&spec.name, timeout.as_millis() as u64),
                }
            };

            if error.retryable && attempt < max_attempts {
                self.emit(
                    "tool.retry",
                    json!({
                        "tool": spec.name,
                        "attempt": attempt,
                        "code": error.code.as_str(),
                    }),
                );
                tokio::time::sleep(Duration::from_millis(retry_backoff_ms(attempt - 1))).await;
                continue;
            }
            return (Err(error), attempt);
        }
    }

    fn cache_lookup(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_store(&self, key: String, value: &Value, ttl: Duration) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                key,
                CacheEntry {
                    expires_at: Instant::now() + ttl,
                    value: value.clone(),
                },
            );
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Single-attempt failure envelope for checks that run before the handler.
fn fail_fast(tool: &str, error: ToolError, started: Instant, input_bytes: u64) -> Envelope {
    Envelope::failure(
        tool,
        error,
        CallStats {
            duration_ms: elapsed_ms(started),
            input_bytes,
            attempts: 1,
            cached: false,
        },
    )
}

/// Cache key over the tool name plus key-order-independent argument JSON.
fn cache_key(tool: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(args).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

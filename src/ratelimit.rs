use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window call counter, one queue per tool name. State is shared
/// across every caller in the process, so the limit is global rather than
/// per-conversation; that cross-tenant fairness limitation is deliberate.
pub struct RateLimiter {
    window: Duration,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    /// Shrinking the window keeps tests fast without mocking clocks.
    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Records one call against `tool` if the per-window limit permits it.
    /// Returns false when the call must be rejected; rejected calls are not
    /// recorded, so they do not extend the caller's penalty.
    pub fn check(&self, tool: &str, limit_per_window: u32) -> bool {
        let now = Instant::now();
        let mut calls = match self.calls.lock() {
            Ok(guard) => guard,
            // A poisoned lock means another caller panicked mid-update;
            // the queue contents are still just timestamps, so keep going.
            Err(poisoned) => poisoned.into_inner(),
        };
        let queue = calls.entry(tool.to_string()).or_default();
        while let Some(front) = queue.front() {
            if now.duration_since(*front) >= self.window {
                queue.pop_front();
            } else {
                break;
            }
        }
        if queue.len() >= limit_per_window as usize {
            return false;
        }
        queue.push_back(now);
        true
    }

    /// Calls currently counted against `tool` inside the window.
    pub fn current_count(&self, tool: &str) -> usize {
        let now = Instant::now();
        let calls = match self.calls.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        calls
            .get(tool)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }
}

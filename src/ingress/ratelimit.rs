//! Per-client rate limiting for the webhook endpoints.
//!
//! A fixed window per client IP: a counter and the window's start
//! timestamp. Checked before any other webhook work, so a misbehaving
//! sender cannot reach signature verification or parsing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default window length.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default requests admitted per window per client.
const DEFAULT_MAX_REQUESTS: u32 = 120;

/// Sweep stale windows when the map grows past this.
const SWEEP_THRESHOLD: usize = 10_000;

struct Window {
    count: u32,
    started_at: Instant,
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_limit(mut self, max_requests: u32, window: Duration) -> Self {
        self.max_requests = max_requests.max(1);
        self.window = window;
        self
    }

    /// Admit or reject one request from `client`.
    pub fn allow(&self, client: &str) -> bool {
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();

        if windows.len() > SWEEP_THRESHOLD {
            let window = self.window;
            windows.retain(|_, w| now.duration_since(w.started_at) < window);
        }

        let entry = windows.entry(client.to_string()).or_insert(Window {
            count: 0,
            started_at: now,
        });
        if now.duration_since(entry.started_at) >= self.window {
            entry.count = 0;
            entry.started_at = now;
        }
        if entry.count >= self.max_requests {
            return false;
        }
        entry.count += 1;
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

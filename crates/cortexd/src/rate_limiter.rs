//! Fixed one-second window request limiter for the IPC server

use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

struct Window {
    started: Instant,
    count: u32,
    limit: u32,
}

pub struct RateLimiter {
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            window: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
                limit,
            }),
        }
    }

    /// Consume one unit from the current window, or refuse
    pub fn try_acquire(&self) -> bool {
        let mut w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if now.duration_since(w.started) >= WINDOW {
            w.started = now;
            w.count = 0;
        }
        if w.count < w.limit {
            w.count += 1;
            true
        } else {
            false
        }
    }

    /// Start a fresh window
    pub fn reset(&self) {
        let mut w = self.window.lock().unwrap_or_else(|e| e.into_inner());
        w.started = Instant::now();
        w.count = 0;
    }

    /// Apply a new ceiling; the current window's count is kept
    pub fn set_limit(&self, limit: u32) {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).limit = limit;
    }

    pub fn limit(&self) -> u32 {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).limit
    }
}

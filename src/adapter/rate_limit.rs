// =============================================================================
// Per-venue token-bucket rate tracking (spec §5)
// =============================================================================

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Tracks request weight and order-placement counters for a single venue
/// connection, refreshed either from response headers (where the venue
/// provides them) or from a local clock-windowed counter otherwise.
pub struct RateLimitTracker {
    requests_per_sec_limit: u32,
    window_start_ms: AtomicU64,
    requests_this_window: AtomicU32,
    order_count_10s: AtomicU32,
    order_window_start_ms: AtomicU64,
    order_10s_limit: u32,
}

impl RateLimitTracker {
    pub fn new(requests_per_sec_limit: u32, order_10s_limit: u32) -> Self {
        let now = now_ms();
        Self {
            requests_per_sec_limit,
            window_start_ms: AtomicU64::new(now),
            requests_this_window: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_window_start_ms: AtomicU64::new(now),
            order_10s_limit,
        }
    }

    /// Pre-flight check before issuing any request.
    pub fn can_send_request(&self) -> bool {
        self.roll_request_window();
        self.requests_this_window.load(Ordering::Relaxed) < self.requests_per_sec_limit
    }

    /// Pre-flight check specifically for order-placing endpoints.
    pub fn can_place_order(&self) -> bool {
        self.roll_order_window();
        self.order_count_10s.load(Ordering::Relaxed) < self.order_10s_limit
    }

    pub fn record_request_sent(&self) {
        self.roll_request_window();
        self.requests_this_window.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order_sent(&self) {
        self.roll_order_window();
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
    }

    fn roll_request_window(&self) {
        let now = now_ms();
        let start = self.window_start_ms.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= 1_000 {
            self.window_start_ms.store(now, Ordering::Relaxed);
            self.requests_this_window.store(0, Ordering::Relaxed);
        }
    }

    fn roll_order_window(&self) {
        let now = now_ms();
        let start = self.order_window_start_ms.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= 10_000 {
            self.order_window_start_ms.store(now, Ordering::Relaxed);
            self.order_count_10s.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            requests_this_window: self.requests_this_window.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSnapshot {
    pub requests_this_window: u32,
    pub order_count_10s: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_requests_under_the_limit() {
        let tracker = RateLimitTracker::new(10, 10);
        for _ in 0..9 {
            assert!(tracker.can_send_request());
            tracker.record_request_sent();
        }
        assert!(tracker.can_send_request());
    }

    #[test]
    fn blocks_requests_once_limit_reached() {
        let tracker = RateLimitTracker::new(3, 10);
        for _ in 0..3 {
            assert!(tracker.can_send_request());
            tracker.record_request_sent();
        }
        assert!(!tracker.can_send_request());
    }

    #[test]
    fn order_window_is_independent_of_request_window() {
        let tracker = RateLimitTracker::new(100, 2);
        tracker.record_order_sent();
        tracker.record_order_sent();
        assert!(!tracker.can_place_order());
        assert!(tracker.can_send_request());
    }
}

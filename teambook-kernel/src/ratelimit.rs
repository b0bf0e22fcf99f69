//! Per-AI sliding-window rate limiting and error-cascade tripping.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use teambook_core::{
    AiId, ErrorCode, TeambookError, ERROR_CASCADE_THRESHOLD, MAX_CALLS_PER_MINUTE,
    MAX_CALLS_PER_SECOND, MAX_EVENT_QUERY_RATE, MAX_MESSAGES_PER_MINUTE,
};

/// Which window a call counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Call,
    Message,
    EventQuery,
    Error,
}

#[derive(Default)]
struct Window {
    hits: Vec<Instant>,
}

impl Window {
    fn admit(&mut self, now: Instant, span: Duration, cap: usize) -> bool {
        self.hits.retain(|t| now.duration_since(*t) < span);
        if self.hits.len() >= cap {
            return false;
        }
        self.hits.push(now);
        true
    }

    fn count(&mut self, now: Instant, span: Duration) -> usize {
        self.hits.retain(|t| now.duration_since(*t) < span);
        self.hits.len()
    }
}

/// Sliding windows keyed by `(ai_id, kind)`; all state is in-memory and
/// process-local.
pub struct RateLimiter {
    windows: DashMap<(AiId, LimitKind), Window>,
    second_windows: DashMap<AiId, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            second_windows: DashMap::new(),
        }
    }

    /// Admit one kernel call for `ai`. Checks the per-second and per-minute
    /// windows together.
    pub fn admit_call(&self, ai: &AiId) -> Result<(), TeambookError> {
        let now = Instant::now();
        {
            let mut window = self.second_windows.entry(ai.clone()).or_default();
            if !window.admit(now, Duration::from_secs(1), MAX_CALLS_PER_SECOND) {
                return Err(TeambookError::rate_limit("too many calls this second"));
            }
        }
        self.admit(ai, LimitKind::Call, Duration::from_secs(60), MAX_CALLS_PER_MINUTE)
    }

    pub fn admit_message(&self, ai: &AiId) -> Result<(), TeambookError> {
        self.admit(
            ai,
            LimitKind::Message,
            Duration::from_secs(60),
            MAX_MESSAGES_PER_MINUTE,
        )
    }

    pub fn admit_event_query(&self, ai: &AiId) -> Result<(), TeambookError> {
        self.admit(
            ai,
            LimitKind::EventQuery,
            Duration::from_secs(60),
            MAX_EVENT_QUERY_RATE,
        )
    }

    /// How many message slots remain in the current minute window.
    pub fn message_quota_remaining(&self, ai: &AiId) -> usize {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((ai.clone(), LimitKind::Message))
            .or_default();
        MAX_MESSAGES_PER_MINUTE.saturating_sub(window.count(now, Duration::from_secs(60)))
    }

    /// Record an error; once the cascade threshold trips, calls are refused
    /// until the window drains.
    pub fn record_error(&self, ai: &AiId) {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((ai.clone(), LimitKind::Error))
            .or_default();
        window.hits.push(now);
        let _ = window.count(now, Duration::from_secs(60));
    }

    pub fn cascade_tripped(&self, ai: &AiId) -> bool {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry((ai.clone(), LimitKind::Error))
            .or_default();
        window.count(now, Duration::from_secs(60)) >= ERROR_CASCADE_THRESHOLD
    }

    fn admit(
        &self,
        ai: &AiId,
        kind: LimitKind,
        span: Duration,
        cap: usize,
    ) -> Result<(), TeambookError> {
        let now = Instant::now();
        let mut window = self.windows.entry((ai.clone(), kind)).or_default();
        if window.admit(now, span, cap) {
            Ok(())
        } else {
            Err(TeambookError::new(
                ErrorCode::RateLimit,
                format!("limit of {} per window reached", cap),
            ))
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_window_caps() {
        let limiter = RateLimiter::new();
        let ai = AiId::from("alpha-001");
        for _ in 0..MAX_MESSAGES_PER_MINUTE {
            limiter.admit_message(&ai).expect("under cap");
        }
        assert!(limiter.admit_message(&ai).is_err());
        assert_eq!(limiter.message_quota_remaining(&ai), 0);
    }

    #[test]
    fn test_windows_are_per_ai() {
        let limiter = RateLimiter::new();
        for _ in 0..MAX_MESSAGES_PER_MINUTE {
            limiter.admit_message(&AiId::from("alpha-001")).expect("under cap");
        }
        limiter
            .admit_message(&AiId::from("beta-002"))
            .expect("other AI unaffected");
    }

    #[test]
    fn test_error_cascade() {
        let limiter = RateLimiter::new();
        let ai = AiId::from("alpha-001");
        assert!(!limiter.cascade_tripped(&ai));
        for _ in 0..ERROR_CASCADE_THRESHOLD {
            limiter.record_error(&ai);
        }
        assert!(limiter.cascade_tripped(&ai));
    }
}

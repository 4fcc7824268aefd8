use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by client. Idle clients are swept once per window.
#[derive(Debug, Clone)]
pub struct ApiRateLimiter {
    window: Duration,
    max_requests: u32,
    buckets: Arc<DashMap<String, Vec<Instant>>>,
    last_sweep: Arc<Mutex<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

impl ApiRateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            buckets: Arc::new(DashMap::new()),
            last_sweep: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn allow(&self, client: &str) -> RateDecision {
        self.allow_at(client, Instant::now())
    }

    fn allow_at(&self, client: &str, now: Instant) -> RateDecision {
        let decision = self.record(client, now);
        self.sweep_if_due(now);
        decision
    }

    fn record(&self, client: &str, now: Instant) -> RateDecision {
        let window = self.window;
        let mut entry = self.buckets.entry(client.to_string()).or_default();
        entry.retain(|instant| now.saturating_duration_since(*instant) < window);

        let remaining = self
            .max_requests
            .saturating_sub(u32::try_from(entry.len()).unwrap_or(u32::MAX));
        if remaining == 0 {
            return RateDecision {
                allowed: false,
                remaining: 0,
            };
        }

        entry.push(now);
        RateDecision {
            allowed: true,
            remaining: remaining - 1,
        }
    }

    /// Drop buckets with no hit inside the window. Must run with no shard guard held.
    fn sweep_if_due(&self, now: Instant) {
        // A concurrent caller is already sweeping.
        let Ok(mut last_sweep) = self.last_sweep.try_lock() else {
            return;
        };
        if now.saturating_duration_since(*last_sweep) < self.window {
            return;
        }

        let window = self.window;
        self.buckets.retain(|_, hits| {
            hits.retain(|instant| now.saturating_duration_since(*instant) < window);
            !hits.is_empty()
        });
        *last_sweep = now;
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_then_recovers_after_window() {
        let limiter = ApiRateLimiter::new(Duration::from_secs(10), 2);
        let start = Instant::now();

        assert_eq!(
            limiter.allow_at("10.0.0.1", start),
            RateDecision {
                allowed: true,
                remaining: 1
            }
        );
        assert!(limiter.allow_at("10.0.0.1", start).allowed);
        assert!(!limiter.allow_at("10.0.0.1", start).allowed);

        // Other clients keep their own budget.
        assert!(limiter.allow_at("10.0.0.2", start).allowed);

        let later = start + Duration::from_secs(11);
        assert!(limiter.allow_at("10.0.0.1", later).allowed);
    }

    #[test]
    fn idle_clients_are_forgotten_after_a_window() {
        let limiter = ApiRateLimiter::new(Duration::from_millis(1), 5);
        let start = Instant::now();

        for n in 0..10_000 {
            limiter.allow_at(&format!("client-{n}"), start);
        }
        assert!(limiter.tracked_clients() > 1);

        let later = start + Duration::from_secs(3600);
        assert!(limiter.allow_at("late", later).allowed);
        assert_eq!(limiter.tracked_clients(), 1);
    }
}

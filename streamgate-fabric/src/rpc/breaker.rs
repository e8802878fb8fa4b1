//! Per-instance circuit breaker.
//!
//! Closed until `failure_threshold` failures land within `window`; then open
//! for `open_duration`, refusing calls without touching the network. After
//! the cool-down a single half-open probe is admitted: success closes the
//! breaker, failure re-opens it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within `window` that trip the breaker.
    pub failure_threshold: u32,
    /// Sliding window over which failures are counted.
    #[serde(with = "crate::duration_serde")]
    pub window: Duration,
    /// How long the breaker stays open before admitting a probe.
    #[serde(with = "crate::duration_serde")]
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            open_duration: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed { failures: VecDeque<Instant> },
    Open { since: Instant },
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct Tracking {
    phase: Phase,
    successes: u64,
    failures: u64,
}

/// Admission decision. `Probe` admits the single half-open call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Probe,
    /// Refused; retry after the embedded duration.
    Refused(Duration),
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    tracking: Mutex<Tracking>,
}

/// Point-in-time breaker counters for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub successes: u64,
    pub failures: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            tracking: Mutex::new(Tracking {
                phase: Phase::Closed {
                    failures: VecDeque::new(),
                },
                successes: 0,
                failures: 0,
            }),
        }
    }

    /// Decide whether a call may proceed. Transitions open to half-open once
    /// the cool-down elapses, and reserves the half-open probe slot.
    pub async fn admit(&self) -> Admission {
        let mut tracking = self.tracking.lock().await;
        match &mut tracking.phase {
            Phase::Closed { .. } => Admission::Admitted,
            Phase::Open { since } => {
                let elapsed = since.elapsed();
                if elapsed >= self.config.open_duration {
                    tracking.phase = Phase::HalfOpen {
                        probe_in_flight: true,
                    };
                    Admission::Probe
                } else {
                    Admission::Refused(self.config.open_duration - elapsed)
                }
            }
            Phase::HalfOpen { probe_in_flight } => {
                if *probe_in_flight {
                    Admission::Refused(self.config.open_duration)
                } else {
                    *probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    pub async fn on_success(&self) {
        let mut tracking = self.tracking.lock().await;
        tracking.successes += 1;
        match &mut tracking.phase {
            Phase::Closed { failures } => failures.clear(),
            Phase::HalfOpen { .. } => {
                tracking.phase = Phase::Closed {
                    failures: VecDeque::new(),
                };
            }
            Phase::Open { .. } => {}
        }
    }

    pub async fn on_failure(&self) {
        let now = Instant::now();
        let mut tracking = self.tracking.lock().await;
        tracking.failures += 1;
        match &mut tracking.phase {
            Phase::Closed { failures } => {
                failures.push_back(now);
                while let Some(front) = failures.front() {
                    if now.duration_since(*front) > self.config.window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() as u32 >= self.config.failure_threshold {
                    tracking.phase = Phase::Open { since: now };
                }
            }
            Phase::HalfOpen { .. } => {
                tracking.phase = Phase::Open { since: now };
            }
            Phase::Open { .. } => {}
        }
    }

    pub async fn state(&self) -> BreakerState {
        match &self.tracking.lock().await.phase {
            Phase::Closed { .. } => BreakerState::Closed,
            Phase::Open { .. } => BreakerState::Open,
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let tracking = self.tracking.lock().await;
        BreakerSnapshot {
            state: match &tracking.phase {
                Phase::Closed { .. } => BreakerState::Closed,
                Phase::Open { .. } => BreakerState::Open,
                Phase::HalfOpen { .. } => BreakerState::HalfOpen,
            },
            successes: tracking.successes,
            failures: tracking.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, open: Duration) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(10),
            open_duration: open,
        })
    }

    #[tokio::test]
    async fn stays_closed_below_threshold() {
        let b = breaker(3, Duration::from_secs(5));
        b.on_failure().await;
        b.on_failure().await;
        assert_eq!(b.state().await, BreakerState::Closed);
        assert_eq!(b.admit().await, Admission::Admitted);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_refuses() {
        let b = breaker(3, Duration::from_secs(5));
        for _ in 0..3 {
            b.on_failure().await;
        }
        assert_eq!(b.state().await, BreakerState::Open);
        assert!(matches!(b.admit().await, Admission::Refused(_)));
    }

    #[tokio::test]
    async fn success_clears_failure_window() {
        let b = breaker(3, Duration::from_secs(5));
        b.on_failure().await;
        b.on_failure().await;
        b.on_success().await;
        for _ in 0..2 {
            b.on_failure().await;
        }
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe() {
        let b = breaker(1, Duration::from_secs(5));
        b.on_failure().await;
        assert_eq!(b.state().await, BreakerState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(b.admit().await, Admission::Probe);
        // Second caller while the probe is outstanding is refused.
        assert!(matches!(b.admit().await, Admission::Refused(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_probe_failure_reopens() {
        let b = breaker(1, Duration::from_secs(5));
        b.on_failure().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(b.admit().await, Admission::Probe);
        b.on_success().await;
        assert_eq!(b.state().await, BreakerState::Closed);

        b.on_failure().await;
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(b.admit().await, Admission::Probe);
        b.on_failure().await;
        assert_eq!(b.state().await, BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_age_out_of_window() {
        let b = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(2),
            open_duration: Duration::from_secs(5),
        });
        b.on_failure().await;
        b.on_failure().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        b.on_failure().await;
        // Only one failure inside the window; still closed.
        assert_eq!(b.state().await, BreakerState::Closed);
    }
}

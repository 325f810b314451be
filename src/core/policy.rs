//! Restart policy - Cooldown and optional crash ceiling per instance

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Crash ceiling: at most `max_restarts` restarts within `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartBudget {
    pub max_restarts: u32,
    pub window: Duration,
}

/// Restart settings shared by every instance of a fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Pause between a crash and the next launch
    pub cooldown: Duration,
    /// `None` means restart forever
    pub budget: Option<RestartBudget>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_millis(100),
            budget: None,
        }
    }
}

/// What to do after a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Restart { after: Duration },
    GiveUp { crashes: usize, window: Duration },
}

/// Per-instance crash history evaluated against a [`RestartPolicy`]
#[derive(Debug, Clone)]
pub struct RestartTracker {
    policy: RestartPolicy,
    crashes: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            crashes: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Crashes currently inside the observation window
    pub fn recent_crashes(&self) -> usize {
        self.crashes.len()
    }

    /// Record a crash at `now` and decide whether to relaunch.
    ///
    /// With a budget of `k`, the `k+1`-th crash inside the window gives up.
    pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
        let Some(budget) = self.policy.budget else {
            return RestartDecision::Restart {
                after: self.policy.cooldown,
            };
        };

        self.crashes.push_back(now);
        while let Some(&oldest) = self.crashes.front() {
            if now.duration_since(oldest) > budget.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }

        if self.crashes.len() > budget.max_restarts as usize {
            RestartDecision::GiveUp {
                crashes: self.crashes.len(),
                window: budget.window,
            }
        } else {
            RestartDecision::Restart {
                after: self.policy.cooldown,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounded(k: u32, window_secs: u64) -> RestartTracker {
        RestartTracker::new(RestartPolicy {
            cooldown: Duration::from_millis(5),
            budget: Some(RestartBudget {
                max_restarts: k,
                window: Duration::from_secs(window_secs),
            }),
        })
    }

    #[test]
    fn unlimited_always_restarts() {
        let mut tracker = RestartTracker::new(RestartPolicy::default());
        let now = Instant::now();
        for _ in 0..1000 {
            assert_eq!(
                tracker.record_crash(now),
                RestartDecision::Restart {
                    after: Duration::from_millis(100)
                }
            );
        }
        assert_eq!(tracker.recent_crashes(), 0);
    }

    #[test]
    fn gives_up_on_crash_k_plus_one() {
        let mut tracker = bounded(3, 60);
        let now = Instant::now();
        for i in 0..3 {
            let at = now + Duration::from_secs(i);
            assert!(matches!(
                tracker.record_crash(at),
                RestartDecision::Restart { .. }
            ));
        }
        assert_eq!(
            tracker.record_crash(now + Duration::from_secs(3)),
            RestartDecision::GiveUp {
                crashes: 4,
                window: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn old_crashes_slide_out_of_the_window() {
        let mut tracker = bounded(2, 10);
        let now = Instant::now();
        tracker.record_crash(now);
        tracker.record_crash(now + Duration::from_secs(1));
        // Both earlier crashes are older than the window by now
        let later = now + Duration::from_secs(30);
        assert!(matches!(
            tracker.record_crash(later),
            RestartDecision::Restart { .. }
        ));
        assert_eq!(tracker.recent_crashes(), 1);
    }

    #[test]
    fn zero_budget_never_restarts() {
        let mut tracker = bounded(0, 60);
        assert!(matches!(
            tracker.record_crash(Instant::now()),
            RestartDecision::GiveUp { crashes: 1, .. }
        ));
    }
}

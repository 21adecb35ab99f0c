//! Rate-limit governor.
//!
//! `Open` until any dispatched call reports a rate limit, then `Halted` for
//! the rest of the session. The stated wait is informational: only an
//! explicit [`RateLimitGovernor::reset`] reopens dispatch.

use almgate_kernel::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RateLimitState {
    Open,
    Halted { resume_after_seconds: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitGovernor {
    halt: Option<Halt>,
}

#[derive(Debug, Clone, Copy)]
struct Halt {
    seconds: u64,
    at: DateTime<Utc>,
}

impl RateLimitGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RateLimitState {
        match self.halt {
            None => RateLimitState::Open,
            Some(halt) => RateLimitState::Halted {
                resume_after_seconds: halt.seconds,
            },
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// When the halt was recorded.
    pub fn halted_at(&self) -> Option<DateTime<Utc>> {
        self.halt.map(|h| h.at)
    }

    /// Gate for the next dispatch.
    pub fn check(&self) -> Result<(), OrchestratorError> {
        self.check_at(Utc::now())
    }

    pub fn check_at(&self, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        match self.seconds_remaining_at(now) {
            None => Ok(()),
            Some(seconds_remaining) => Err(OrchestratorError::Halted { seconds_remaining }),
        }
    }

    /// Enter `Halted`. A second signal while halted replaces the wait.
    pub fn halt(&mut self, seconds: u64) {
        self.halt_at(seconds, Utc::now());
    }

    pub fn halt_at(&mut self, seconds: u64, now: DateTime<Utc>) {
        self.halt = Some(Halt { seconds, at: now });
    }

    /// Explicit external reset; the only way back to `Open`.
    pub fn reset(&mut self) -> RateLimitState {
        let previous = self.state();
        self.halt = None;
        previous
    }

    pub fn seconds_remaining(&self) -> Option<u64> {
        self.seconds_remaining_at(Utc::now())
    }

    /// Stated wait minus elapsed time, floored at zero. `None` when open.
    ///
    /// Reaching zero does not reopen the gate.
    pub fn seconds_remaining_at(&self, now: DateTime<Utc>) -> Option<u64> {
        self.halt.map(|halt| {
            let elapsed = (now - halt.at).num_seconds().max(0) as u64;
            halt.seconds.saturating_sub(elapsed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn starts_open() {
        let governor = RateLimitGovernor::new();
        assert_eq!(governor.state(), RateLimitState::Open);
        assert!(governor.check_at(t0()).is_ok());
        assert_eq!(governor.seconds_remaining_at(t0()), None);
    }

    #[test]
    fn halt_reports_remaining_wait() {
        let mut governor = RateLimitGovernor::new();
        governor.halt_at(30, t0());
        assert_eq!(
            governor.check_at(t0()),
            Err(OrchestratorError::Halted {
                seconds_remaining: 30
            })
        );
        assert_eq!(
            governor.check_at(t0() + Duration::seconds(12)),
            Err(OrchestratorError::Halted {
                seconds_remaining: 18
            })
        );
    }

    #[test]
    fn never_reopens_on_its_own() {
        let mut governor = RateLimitGovernor::new();
        governor.halt_at(30, t0());
        let much_later = t0() + Duration::hours(2);
        assert_eq!(
            governor.check_at(much_later),
            Err(OrchestratorError::Halted {
                seconds_remaining: 0
            })
        );
        assert!(governor.is_halted());
    }

    #[test]
    fn reset_is_the_only_way_back() {
        let mut governor = RateLimitGovernor::new();
        governor.halt_at(5, t0());
        assert_eq!(
            governor.reset(),
            RateLimitState::Halted {
                resume_after_seconds: 5
            }
        );
        assert_eq!(governor.state(), RateLimitState::Open);
        assert!(governor.check_at(t0()).is_ok());
    }

    #[test]
    fn halted_state_serializes_camel_case() {
        let mut governor = RateLimitGovernor::new();
        governor.halt_at(5, t0());
        assert_eq!(
            serde_json::to_value(governor.state()).expect("serializable"),
            serde_json::json!({"state": "halted", "resumeAfterSeconds": 5})
        );
    }
}

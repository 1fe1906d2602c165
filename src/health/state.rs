//! Health state machine.
//!
//! ```text
//! healthy  --block-------------------> paused
//! healthy  --N ambiguous failures----> degraded
//! degraded --ambiguous failure-------> paused
//! degraded --block-------------------> paused
//! degraded --success-----------------> healthy
//! paused   --(expired AND claimed)---> healthy
//! ```
//!
//! Signals that arrive while paused are ignored. Only the claim performed by
//! `HealthMonitor::try_unpause` leaves the paused mode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthMode {
    Healthy,
    /// Ambiguous failures accumulated; the next failure pauses.
    Degraded,
    /// All ingestion and delivery suspended until `paused_until`.
    Paused,
}

impl HealthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for HealthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown health mode '{other}'")),
        }
    }
}

/// Outcome observed by a worker and fed to the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    Success,
    /// Failed without evidence of blocking (timeouts, 5xx, empty pages).
    AmbiguousFailure,
    /// Explicit evidence the upstream is refusing us.
    Blocked { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    pub mode: HealthMode,
    pub paused_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::healthy()
    }
}

impl HealthState {
    pub fn healthy() -> Self {
        Self {
            mode: HealthMode::Healthy,
            paused_until: None,
            consecutive_failures: 0,
        }
    }

    fn paused(until: DateTime<Utc>) -> Self {
        Self {
            mode: HealthMode::Paused,
            paused_until: Some(until),
            consecutive_failures: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.mode == HealthMode::Paused
    }

    /// Paused and the window has elapsed at `now`.
    pub fn pause_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_paused() && self.paused_until.is_none_or(|until| now >= until)
    }

    /// Next state after `signal`, or `None` if the signal changes nothing.
    /// `pause_until` is only consulted for transitions into paused.
    pub fn apply(
        &self,
        signal: &HealthSignal,
        degrade_after: u32,
        pause_until: impl FnOnce() -> DateTime<Utc>,
    ) -> Option<HealthState> {
        match (self.mode, signal) {
            (HealthMode::Paused, _) => None,

            (HealthMode::Healthy, HealthSignal::Success) => {
                if self.consecutive_failures == 0 {
                    None
                } else {
                    Some(Self::healthy())
                }
            }
            (HealthMode::Healthy, HealthSignal::AmbiguousFailure) => {
                let failures = self.consecutive_failures + 1;
                let mode = if failures >= degrade_after {
                    HealthMode::Degraded
                } else {
                    HealthMode::Healthy
                };
                Some(Self {
                    mode,
                    paused_until: None,
                    consecutive_failures: failures,
                })
            }

            (HealthMode::Degraded, HealthSignal::Success) => Some(Self::healthy()),
            (HealthMode::Degraded, HealthSignal::AmbiguousFailure) => {
                Some(Self::paused(pause_until()))
            }

            (_, HealthSignal::Blocked { .. }) => Some(Self::paused(pause_until())),
        }
    }
}

/// Persisted state plus the version used for compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub state: HealthState,
    pub version: i64,
}

/// One line of the health transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub from: HealthMode,
    pub to: HealthMode,
    pub reason: String,
    pub paused_until: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn until() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T06:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn ambiguous_failures_degrade_after_threshold() {
        let mut s = HealthState::healthy();
        for _ in 0..2 {
            s = s.apply(&HealthSignal::AmbiguousFailure, 3, until).unwrap();
            assert_eq!(s.mode, HealthMode::Healthy);
        }
        s = s.apply(&HealthSignal::AmbiguousFailure, 3, until).unwrap();
        assert_eq!(s.mode, HealthMode::Degraded);
        assert_eq!(s.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failures() {
        let s = HealthState {
            mode: HealthMode::Healthy,
            paused_until: None,
            consecutive_failures: 2,
        };
        assert_eq!(
            s.apply(&HealthSignal::Success, 3, until),
            Some(HealthState::healthy())
        );
        assert_eq!(
            HealthState::healthy().apply(&HealthSignal::Success, 3, until),
            None
        );
    }

    #[test]
    fn degraded_recovers_or_pauses() {
        let degraded = HealthState {
            mode: HealthMode::Degraded,
            paused_until: None,
            consecutive_failures: 3,
        };
        assert_eq!(
            degraded.apply(&HealthSignal::Success, 3, until).unwrap().mode,
            HealthMode::Healthy
        );
        let paused = degraded
            .apply(&HealthSignal::AmbiguousFailure, 3, until)
            .unwrap();
        assert_eq!(paused.mode, HealthMode::Paused);
        assert_eq!(paused.paused_until, Some(until()));
    }

    #[test]
    fn block_pauses_from_any_active_mode() {
        let blocked = HealthSignal::Blocked {
            reason: "captcha".into(),
        };
        let s = HealthState::healthy().apply(&blocked, 3, until).unwrap();
        assert!(s.is_paused());
        assert_eq!(s.paused_until, Some(until()));
    }

    #[test]
    fn paused_ignores_signals() {
        let paused = HealthState::paused(until());
        for signal in [
            HealthSignal::Success,
            HealthSignal::AmbiguousFailure,
            HealthSignal::Blocked { reason: "x".into() },
        ] {
            assert_eq!(paused.apply(&signal, 3, until), None);
        }
    }

    #[test]
    fn pause_expiry() {
        let paused = HealthState::paused(until());
        assert!(!paused.pause_expired(until() - Duration::seconds(1)));
        assert!(paused.pause_expired(until()));
        assert!(!HealthState::healthy().pause_expired(until()));
    }
}

//! Retry budget and cooldown decisions.

use chrono::{DateTime, Duration, Utc};

use crate::models::{Failure, FailureReason, RetryMode};
use crate::repository::RetryWindow;

/// What happens to an entity after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Budget remains; back to `pending` right away.
    Requeue,
    /// Budget remains; stays `failed` until the cooldown elapses.
    RetryAfterCooldown,
    /// Transient failure that used up the last attempt.
    Exhausted,
    /// Permanent failure; never retried automatically.
    Rejected,
}

impl FailureOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::minutes(15),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
        }
    }

    /// Whether an entity may be attempted again at `now`.
    ///
    /// An entity never attempted before is eligible as soon as the budget
    /// allows. Permanent failure reasons are never eligible.
    pub fn is_eligible(
        &self,
        attempts: u32,
        last_attempt_at: Option<DateTime<Utc>>,
        reason: Option<FailureReason>,
        now: DateTime<Utc>,
    ) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }
        if reason.is_some_and(|r| !r.is_retryable()) {
            return false;
        }
        match last_attempt_at {
            Some(last) => now - last >= self.cooldown,
            None => true,
        }
    }

    /// Classify a failure given the attempt count after it was recorded.
    pub fn outcome_for(&self, attempts_after: u32, failure: &Failure, mode: RetryMode) -> FailureOutcome {
        if !failure.is_retryable() {
            return FailureOutcome::Rejected;
        }
        if attempts_after >= self.max_attempts {
            return FailureOutcome::Exhausted;
        }
        match mode {
            RetryMode::Requeue => FailureOutcome::Requeue,
            RetryMode::Cooldown => FailureOutcome::RetryAfterCooldown,
        }
    }

    pub fn window(&self) -> RetryWindow {
        RetryWindow {
            max_attempts: self.max_attempts,
            cooldown: self.cooldown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_cooldown_gates_eligibility() {
        let policy = RetryPolicy::new(3, Duration::minutes(15));
        let reason = Some(FailureReason::Transient);

        assert!(!policy.is_eligible(2, Some(t0()), reason, t0() + Duration::minutes(10)));
        assert!(policy.is_eligible(2, Some(t0()), reason, t0() + Duration::minutes(15)));
        assert!(policy.is_eligible(2, Some(t0()), reason, t0() + Duration::minutes(20)));
    }

    #[test]
    fn test_budget_and_reason_gate_eligibility() {
        let policy = RetryPolicy::default();
        let later = t0() + Duration::days(1);

        assert!(!policy.is_eligible(3, Some(t0()), Some(FailureReason::Transient), later));
        assert!(!policy.is_eligible(0, Some(t0()), Some(FailureReason::FileLimit), later));
        assert!(policy.is_eligible(0, None, None, t0()));
    }

    #[test]
    fn test_outcomes() {
        let policy = RetryPolicy::new(3, Duration::minutes(15));
        let transient = Failure::transient("timeout");
        let permanent = Failure::permanent(FailureReason::FileLimit, "812 files");

        assert_eq!(
            policy.outcome_for(1, &transient, RetryMode::Requeue),
            FailureOutcome::Requeue
        );
        assert_eq!(
            policy.outcome_for(2, &transient, RetryMode::Cooldown),
            FailureOutcome::RetryAfterCooldown
        );
        assert_eq!(
            policy.outcome_for(3, &transient, RetryMode::Requeue),
            FailureOutcome::Exhausted
        );
        assert_eq!(
            policy.outcome_for(0, &permanent, RetryMode::Requeue),
            FailureOutcome::Rejected
        );
        assert!(FailureOutcome::Rejected.is_terminal());
        assert!(!FailureOutcome::Requeue.is_terminal());
    }
}

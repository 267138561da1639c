//! Pure restart-policy evaluation.
//!
//! The supervisor state machine calls [`evaluate`] from `Evaluating` after a
//! run ends on its own (user-initiated stops never reach evaluation). The
//! function has no side effects; the caller applies the decision and
//! advances `consecutive_failures`.

use std::time::Duration;

use crate::models::{ExitStatus, RestartPolicy};

/// Outcome of policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Settle into `Stopped`.
    Stop,
    /// Retries exhausted; settle into `Failed`.
    Exhausted,
    /// Schedule another attempt after `delay`.
    Retry { delay: Duration },
}

/// Decides what to do after an exit, given the failure streak so far.
///
/// `consecutive_failures` is the count *before* this exit; the caller
/// increments it when the decision is `Retry`.
pub fn evaluate(
    policy: &RestartPolicy,
    exit: ExitStatus,
    consecutive_failures: u32,
) -> RestartDecision {
    if exit.is_success() {
        if !policy.restart_on_success {
            return RestartDecision::Stop;
        }
    } else if !policy.restart_on_exit_codes.is_empty() {
        // A restricted code set only matches real exit codes; signals and
        // spawn failures fall outside any set.
        let matches = match exit {
            ExitStatus::Code(code) => policy.restart_on_exit_codes.contains(&code),
            ExitStatus::Signal(_) | ExitStatus::SpawnFailed => false,
        };
        if !matches {
            return RestartDecision::Stop;
        }
    }

    if let Some(max) = policy.max_retries {
        if consecutive_failures + 1 > max {
            return RestartDecision::Exhausted;
        }
    }

    RestartDecision::Retry {
        delay: backoff_delay(policy, consecutive_failures),
    }
}

/// Backoff delay for the given failure streak:
/// `min(initial_delay * multiplier^failures, max_delay)`.
pub fn backoff_delay(policy: &RestartPolicy, consecutive_failures: u32) -> Duration {
    let factor = policy.multiplier.powi(consecutive_failures.min(i32::MAX as u32) as i32);
    if !factor.is_finite() {
        return policy.max_delay;
    }
    let scaled = policy.initial_delay.as_secs_f64() * factor;
    if !scaled.is_finite() || scaled >= policy.max_delay.as_secs_f64() {
        policy.max_delay
    } else {
        policy.initial_delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn policy(max_retries: Option<u32>) -> RestartPolicy {
        RestartPolicy {
            max_retries,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            ..RestartPolicy::named("test")
        }
    }

    #[test]
    fn test_clean_exit_stops_unless_policy_says_otherwise() {
        let p = policy(Some(3));
        assert_eq!(
            evaluate(&p, ExitStatus::Code(0), 0),
            RestartDecision::Stop
        );

        let mut p = policy(Some(3));
        p.restart_on_success = true;
        assert!(matches!(
            evaluate(&p, ExitStatus::Code(0), 0),
            RestartDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_empty_code_set_means_any_nonzero() {
        let p = policy(Some(3));
        assert!(matches!(
            evaluate(&p, ExitStatus::Code(7), 0),
            RestartDecision::Retry { .. }
        ));
        assert!(matches!(
            evaluate(&p, ExitStatus::Signal(9), 0),
            RestartDecision::Retry { .. }
        ));
        assert!(matches!(
            evaluate(&p, ExitStatus::SpawnFailed, 0),
            RestartDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_restricted_code_set_membership() {
        let mut p = policy(Some(3));
        p.restart_on_exit_codes = BTreeSet::from([7, 42]);

        assert!(matches!(
            evaluate(&p, ExitStatus::Code(7), 0),
            RestartDecision::Retry { .. }
        ));
        assert_eq!(evaluate(&p, ExitStatus::Code(1), 0), RestartDecision::Stop);
        // Signals and spawn failures never match a restricted set.
        assert_eq!(
            evaluate(&p, ExitStatus::Signal(9), 0),
            RestartDecision::Stop
        );
        assert_eq!(
            evaluate(&p, ExitStatus::SpawnFailed, 0),
            RestartDecision::Stop
        );
    }

    #[test]
    fn test_zero_retries_fails_without_backoff() {
        let p = policy(Some(0));
        assert_eq!(
            evaluate(&p, ExitStatus::Code(1), 0),
            RestartDecision::Exhausted
        );
    }

    #[test]
    fn test_retries_exhaust_at_the_bound() {
        let p = policy(Some(3));
        assert!(matches!(
            evaluate(&p, ExitStatus::Code(1), 2),
            RestartDecision::Retry { .. }
        ));
        assert_eq!(
            evaluate(&p, ExitStatus::Code(1), 3),
            RestartDecision::Exhausted
        );
    }

    #[test]
    fn test_unbounded_retries_never_exhaust() {
        let p = policy(None);
        assert!(matches!(
            evaluate(&p, ExitStatus::Code(1), 1_000_000),
            RestartDecision::Retry { .. }
        ));
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let p = policy(None);
        assert_eq!(backoff_delay(&p, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&p, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&p, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&p, 4), Duration::from_secs(10));
        // Far past the cap the exponent overflows f64 range; still capped.
        assert_eq!(backoff_delay(&p, 10_000), Duration::from_secs(10));
    }

    #[test]
    fn test_constant_multiplier_keeps_initial_delay() {
        let mut p = policy(None);
        p.multiplier = 1.0;
        assert_eq!(backoff_delay(&p, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 50), Duration::from_secs(1));
    }
}

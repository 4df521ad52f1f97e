//! Retry ceiling decisions for the two loop-back edges.
//!
//! The policy is immutable for a run and holds no counters; the counters live
//! on the session and are passed in on every decision.

use serde::{Deserialize, Serialize};

use crate::config::{RetryBudget, WorkflowConfig};

/// Which loop-back edge is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    /// Execute -> Generate after a failed tool run.
    Generation,
    /// Verify -> Plan after a verification mismatch.
    Verification,
}

/// `counter < ceiling`.
pub fn can_retry(counter: u32, ceiling: u32) -> bool {
    counter < ceiling
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub budget: RetryBudget,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkflowConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            budget: RetryBudget::Independent,
        }
    }

    pub fn shared(max_retries: u32) -> Self {
        Self {
            max_retries,
            budget: RetryBudget::Shared,
        }
    }

    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            budget: config.retry_budget,
        }
    }

    /// Whether one more loop-back of `kind` is allowed given the current
    /// counters.
    pub fn permits(&self, kind: LoopKind, generation_retries: u32, verification_retries: u32) -> bool {
        match self.budget {
            RetryBudget::Independent => {
                let counter = match kind {
                    LoopKind::Generation => generation_retries,
                    LoopKind::Verification => verification_retries,
                };
                can_retry(counter, self.max_retries)
            }
            RetryBudget::Shared => can_retry(
                generation_retries.saturating_add(verification_retries),
                self.max_retries,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn can_retry_is_strictly_less_than() {
        assert!(can_retry(0, 3));
        assert!(can_retry(2, 3));
        assert!(!can_retry(3, 3));
        assert!(!can_retry(0, 0));
    }

    #[test]
    fn independent_budgets_do_not_interfere() {
        let policy = RetryPolicy::new(2);
        assert!(policy.permits(LoopKind::Generation, 1, 2));
        assert!(!policy.permits(LoopKind::Verification, 1, 2));
        assert!(!policy.permits(LoopKind::Generation, 2, 0));
        assert!(policy.permits(LoopKind::Verification, 2, 0));
    }

    #[test]
    fn shared_budget_counts_both_loops() {
        let policy = RetryPolicy::shared(3);
        assert!(policy.permits(LoopKind::Generation, 1, 1));
        assert!(!policy.permits(LoopKind::Generation, 2, 1));
        assert!(!policy.permits(LoopKind::Verification, 0, 3));
    }

    #[test]
    fn zero_ceiling_forbids_everything() {
        for policy in [RetryPolicy::new(0), RetryPolicy::shared(0)] {
            assert!(!policy.permits(LoopKind::Generation, 0, 0));
            assert!(!policy.permits(LoopKind::Verification, 0, 0));
        }
    }

    #[test]
    fn policy_follows_config() {
        let config = WorkflowConfig {
            max_retries: 7,
            retry_budget: RetryBudget::Shared,
            ..WorkflowConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config), RetryPolicy::shared(7));
    }

    proptest! {
        #[test]
        fn shared_never_permits_more_than_independent(max in 0u32..10, g in 0u32..12, v in 0u32..12) {
            let shared = RetryPolicy::shared(max);
            let independent = RetryPolicy::new(max);
            for kind in [LoopKind::Generation, LoopKind::Verification] {
                if shared.permits(kind, g, v) {
                    prop_assert!(independent.permits(kind, g, v));
                }
            }
        }
    }
}

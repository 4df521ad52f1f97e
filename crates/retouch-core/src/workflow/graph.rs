//! The edit workflow as an explicit transition table.
//!
//! ```text
//! Analyze -> Plan -> Generate -> Execute --ok--> Verify --ok--> End
//!                      ^            |               |
//!                      +--failed----+               |
//!              ^                                    |
//!              +-----------mismatch-----------------+
//! ```
//!
//! Routing is a pure function of the table, the stage outcome, the retry
//! policy and the current counters.

use serde::Serialize;

use super::retry::{LoopKind, RetryPolicy};
use crate::session::{RunStatus, Stage};

/// Where a successful stage hands off to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Stage(Stage),
    End,
}

/// A bounded loop-back edge taken on a soft failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopBack {
    pub target: Stage,
    pub kind: LoopKind,
    /// Terminal status once the loop's budget is spent.
    pub exhausted: RunStatus,
}

/// Outgoing edges of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub stage: Stage,
    pub on_success: Target,
    pub on_soft_failure: Option<LoopBack>,
    /// Terminal status when the stage raises an error.
    pub on_error: RunStatus,
}

pub const TRANSITIONS: [Transition; 5] = [
    Transition {
        stage: Stage::Analyze,
        on_success: Target::Stage(Stage::Plan),
        on_soft_failure: None,
        on_error: RunStatus::FailedConfiguration,
    },
    Transition {
        stage: Stage::Plan,
        on_success: Target::Stage(Stage::Generate),
        on_soft_failure: None,
        on_error: RunStatus::FailedInference,
    },
    Transition {
        stage: Stage::Generate,
        on_success: Target::Stage(Stage::Execute),
        on_soft_failure: None,
        on_error: RunStatus::FailedInference,
    },
    Transition {
        stage: Stage::Execute,
        on_success: Target::Stage(Stage::Verify),
        on_soft_failure: Some(LoopBack {
            target: Stage::Generate,
            kind: LoopKind::Generation,
            exhausted: RunStatus::FailedExecution,
        }),
        on_error: RunStatus::FailedConfiguration,
    },
    Transition {
        stage: Stage::Verify,
        on_success: Target::End,
        on_soft_failure: Some(LoopBack {
            target: Stage::Plan,
            kind: LoopKind::Verification,
            exhausted: RunStatus::FailedVerification,
        }),
        on_error: RunStatus::FailedInference,
    },
];

pub const INITIAL: Stage = Stage::Analyze;

pub fn transition(stage: Stage) -> &'static Transition {
    // TRANSITIONS is ordered like Stage::ALL.
    let idx = Stage::ALL.iter().position(|s| *s == stage).unwrap_or(0);
    &TRANSITIONS[idx]
}

/// What a stage handler observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Execution failure or verification mismatch.
    SoftFailure,
    /// The stage raised an error.
    Error,
}

/// The engine's next move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Next(Stage),
    LoopBack { target: Stage, kind: LoopKind },
    Finish(RunStatus),
}

/// Decide the next move after `stage` finished with `outcome`.
pub fn route(
    stage: Stage,
    outcome: Outcome,
    policy: &RetryPolicy,
    generation_retries: u32,
    verification_retries: u32,
) -> Route {
    let edges = transition(stage);
    match outcome {
        Outcome::Success => match edges.on_success {
            Target::Stage(next) => Route::Next(next),
            Target::End => Route::Finish(RunStatus::Succeeded),
        },
        Outcome::Error => Route::Finish(edges.on_error),
        Outcome::SoftFailure => match edges.on_soft_failure {
            Some(lb) if policy.permits(lb.kind, generation_retries, verification_retries) => {
                Route::LoopBack {
                    target: lb.target,
                    kind: lb.kind,
                }
            }
            Some(lb) => Route::Finish(lb.exhausted),
            // Stages without a loop-back have no soft failures; treat as error.
            None => Route::Finish(edges.on_error),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_ordered_like_stages() {
        for (stage, t) in Stage::ALL.iter().zip(TRANSITIONS.iter()) {
            assert_eq!(*stage, t.stage);
            assert_eq!(transition(*stage).stage, *stage);
        }
    }

    #[test]
    fn only_execute_and_verify_loop_back() {
        let looping: Vec<Stage> = TRANSITIONS
            .iter()
            .filter(|t| t.on_soft_failure.is_some())
            .map(|t| t.stage)
            .collect();
        assert_eq!(looping, vec![Stage::Execute, Stage::Verify]);
    }

    #[test]
    fn loop_backs_target_earliest_fixing_stage() {
        let exec = transition(Stage::Execute).on_soft_failure.unwrap();
        assert_eq!(exec.target, Stage::Generate);
        assert_eq!(exec.kind, LoopKind::Generation);

        let verify = transition(Stage::Verify).on_soft_failure.unwrap();
        assert_eq!(verify.target, Stage::Plan);
        assert_eq!(verify.kind, LoopKind::Verification);
    }

    #[test]
    fn happy_path_walks_to_end() {
        let policy = RetryPolicy::new(3);
        let mut stage = INITIAL;
        let mut visited = vec![stage];
        loop {
            match route(stage, Outcome::Success, &policy, 0, 0) {
                Route::Next(next) => {
                    visited.push(next);
                    stage = next;
                }
                Route::Finish(status) => {
                    assert_eq!(status, RunStatus::Succeeded);
                    break;
                }
                Route::LoopBack { .. } => panic!("no loop-back on success"),
            }
        }
        assert_eq!(visited, Stage::ALL.to_vec());
    }

    #[test]
    fn execute_failure_loops_until_exhausted() {
        let policy = RetryPolicy::new(2);
        assert_eq!(
            route(Stage::Execute, Outcome::SoftFailure, &policy, 1, 0),
            Route::LoopBack {
                target: Stage::Generate,
                kind: LoopKind::Generation
            }
        );
        assert_eq!(
            route(Stage::Execute, Outcome::SoftFailure, &policy, 2, 0),
            Route::Finish(RunStatus::FailedExecution)
        );
    }

    #[test]
    fn verify_mismatch_ignores_generation_counter() {
        let policy = RetryPolicy::new(1);
        assert_eq!(
            route(Stage::Verify, Outcome::SoftFailure, &policy, 1, 0),
            Route::LoopBack {
                target: Stage::Plan,
                kind: LoopKind::Verification
            }
        );
        assert_eq!(
            route(Stage::Verify, Outcome::SoftFailure, &policy, 0, 1),
            Route::Finish(RunStatus::FailedVerification)
        );
    }

    #[test]
    fn errors_are_terminal_per_stage() {
        let policy = RetryPolicy::new(3);
        assert_eq!(
            route(Stage::Analyze, Outcome::Error, &policy, 0, 0),
            Route::Finish(RunStatus::FailedConfiguration)
        );
        assert_eq!(
            route(Stage::Plan, Outcome::Error, &policy, 0, 0),
            Route::Finish(RunStatus::FailedInference)
        );
        assert_eq!(
            route(Stage::Execute, Outcome::Error, &policy, 0, 0),
            Route::Finish(RunStatus::FailedConfiguration)
        );
        assert_eq!(
            route(Stage::Generate, Outcome::Error, &policy, 1, 0),
            Route::Finish(RunStatus::FailedInference)
        );
        // A verifier error is not a rejection: no replan even with budget left.
        assert_eq!(
            route(Stage::Verify, Outcome::Error, &policy, 0, 0),
            Route::Finish(RunStatus::FailedInference)
        );
    }
}

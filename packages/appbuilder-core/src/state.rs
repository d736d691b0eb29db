//! Session state machines.
//!
//! Both machines are explicit tagged values stored on the session and mutated
//! only through the transition functions below; hooks and the policy gate
//! consult the current value instead of re-deriving it.

use serde::{Deserialize, Serialize};

/// Gate controlling whether the preview dev server may start.
///
/// `None` → `Requested` on the first code-mutating tool call, any →
/// `Passed` only through the dedicated review tool, `Passed` →
/// `Invalidated` on any later code mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    #[default]
    None,
    Requested,
    Passed,
    Invalidated,
}

impl ReviewState {
    /// A code-mutating tool call completed successfully.
    pub fn on_code_mutation(self) -> Self {
        match self {
            ReviewState::None => ReviewState::Requested,
            ReviewState::Passed => ReviewState::Invalidated,
            other => other,
        }
    }

    /// The `mark_review_passed` tool ran.
    pub fn on_review_passed(self) -> Self {
        ReviewState::Passed
    }

    pub fn allows_dev_server(self) -> bool {
        self == ReviewState::Passed
    }
}

/// Progress of the requirements/planning workflow for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningState {
    #[default]
    NotStarted,
    Exploring,
    AwaitingClarification,
    Planned,
    Building,
    Done,
}

impl PlanningState {
    /// A data-exploration sub-agent ran successfully.
    pub fn on_exploration(self) -> Self {
        match self {
            PlanningState::NotStarted => PlanningState::Exploring,
            other => other,
        }
    }

    /// The planner sub-agent completed. `needs_clarification` reflects the
    /// planner's own verdict.
    pub fn on_planner_done(self, needs_clarification: bool) -> Self {
        match self {
            PlanningState::NotStarted | PlanningState::Exploring | PlanningState::AwaitingClarification => {
                if needs_clarification {
                    PlanningState::AwaitingClarification
                } else {
                    PlanningState::Planned
                }
            }
            other => other,
        }
    }

    /// A user turn arrived while a plan was waiting on approval.
    pub fn on_user_approval(self) -> Self {
        match self {
            PlanningState::Planned => PlanningState::Building,
            other => other,
        }
    }

    /// The first code mutation landed.
    pub fn on_build_started(self) -> Self {
        match self {
            PlanningState::Planned | PlanningState::AwaitingClarification => PlanningState::Building,
            other => other,
        }
    }

    /// The preview server came up.
    pub fn on_preview_ready(self) -> Self {
        match self {
            PlanningState::Building => PlanningState::Done,
            other => other,
        }
    }
}

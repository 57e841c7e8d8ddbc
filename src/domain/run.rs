//! Pipeline run state.
//!
//! A PipelineRun tracks one request through the stage machine. Transitions
//! are appended in order and never rewritten, so the run can be rebuilt
//! from its transition log the same way the claim it produces is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{ReceiptId, RequestId};

/// Stage of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    PolicyCheck,
    Executing,
    /// Policy denied the command (terminal once recorded)
    Rejected,
    Validating,
    Recording,
    /// Terminal success
    Done,
    /// Terminal failure, reachable from any non-terminal stage
    Failed,
}

impl Stage {
    /// Whether `next` is a legal successor of this stage
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Intake, PolicyCheck)
                | (PolicyCheck, Executing)
                | (PolicyCheck, Rejected)
                | (Executing, Validating)
                | (Validating, Recording)
                | (Recording, Done)
        )
    }

    /// Terminal stages end the run
    ///
    /// REJECTED still records its claim, but nothing follows it.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed | Stage::Rejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::PolicyCheck => "policy_check",
            Stage::Executing => "executing",
            Stage::Rejected => "rejected",
            Stage::Validating => "validating",
            Stage::Recording => "recording",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal stage transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: Stage,
    pub to: Stage,
}

/// State of a single request moving through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Receipt allocated at intake
    pub receipt_id: ReceiptId,

    /// Request being processed
    pub request_id: RequestId,

    /// Current stage
    pub stage: Stage,

    /// When intake started
    pub started_at: DateTime<Utc>,

    /// When a terminal stage was reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Ordered transition log
    pub transitions: Vec<StageTransition>,

    /// Recording attempts made (including the successful one)
    pub recording_attempts: u32,
}

impl PipelineRun {
    pub fn new(receipt_id: ReceiptId, request_id: RequestId) -> Self {
        Self {
            receipt_id,
            request_id,
            stage: Stage::Intake,
            started_at: Utc::now(),
            completed_at: None,
            transitions: Vec::new(),
            recording_attempts: 0,
        }
    }

    /// Move to the next stage
    pub fn advance(&mut self, to: Stage) -> Result<(), IllegalTransition> {
        let from = self.stage;
        if !from.can_advance_to(to) {
            return Err(IllegalTransition { from, to });
        }
        let at = Utc::now();
        self.transitions.push(StageTransition { from, to, at });
        self.stage = to;
        if to.is_terminal() {
            self.completed_at = Some(at);
        }
        Ok(())
    }

    /// Rebuild a run by replaying its transition log
    pub fn from_transitions(
        receipt_id: ReceiptId,
        request_id: RequestId,
        transitions: &[StageTransition],
    ) -> Result<Self, IllegalTransition> {
        let mut run = Self::new(receipt_id, request_id);
        if let Some(first) = transitions.first() {
            run.started_at = first.at;
        }
        for transition in transitions {
            if transition.from != run.stage || !run.stage.can_advance_to(transition.to) {
                return Err(IllegalTransition {
                    from: transition.from,
                    to: transition.to,
                });
            }
            run.stage = transition.to;
            if transition.to.is_terminal() {
                run.completed_at = Some(transition.at);
            }
            run.transitions.push(transition.clone());
        }
        Ok(run)
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Stages visited in order, starting with INTAKE
    pub fn path(&self) -> Vec<Stage> {
        let mut path = vec![Stage::Intake];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> PipelineRun {
        PipelineRun::new(ReceiptId::new(), RequestId::new())
    }

    #[test]
    fn test_happy_path() {
        let mut run = run();
        for stage in [
            Stage::PolicyCheck,
            Stage::Executing,
            Stage::Validating,
            Stage::Recording,
            Stage::Done,
        ] {
            run.advance(stage).unwrap();
        }
        assert!(run.is_finished());
        assert!(run.completed_at.is_some());
        assert_eq!(run.path().len(), 6);
    }

    #[test]
    fn test_failed_reachable_from_any_live_stage() {
        for stage in [
            Stage::Intake,
            Stage::PolicyCheck,
            Stage::Executing,
            Stage::Validating,
            Stage::Recording,
        ] {
            assert!(stage.can_advance_to(Stage::Failed), "{}", stage);
        }
        assert!(!Stage::Done.can_advance_to(Stage::Failed));
        assert!(!Stage::Rejected.can_advance_to(Stage::Failed));
    }

    #[test]
    fn test_skipping_stages_is_rejected() {
        let mut run = run();
        let err = run.advance(Stage::Executing).unwrap_err();
        assert_eq!(err.from, Stage::Intake);
        assert_eq!(run.stage, Stage::Intake);
        assert!(run.transitions.is_empty());
    }

    #[test]
    fn test_replay_matches_live_run() {
        let mut live = run();
        live.advance(Stage::PolicyCheck).unwrap();
        live.advance(Stage::Rejected).unwrap();

        let replayed =
            PipelineRun::from_transitions(live.receipt_id, live.request_id, &live.transitions)
                .unwrap();
        assert_eq!(replayed.stage, Stage::Rejected);
        assert_eq!(replayed.completed_at, live.completed_at);
    }
}

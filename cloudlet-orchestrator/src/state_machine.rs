use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandoffState {
    Validating,
    ResolvingDestination,
    Provisioning,
    AwaitingTransfer,
    Finalizing,
    Done,
    Failed,
}

impl HandoffState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffState::Validating => "VALIDATING",
            HandoffState::ResolvingDestination => "RESOLVING_DESTINATION",
            HandoffState::Provisioning => "PROVISIONING",
            HandoffState::AwaitingTransfer => "AWAITING_TRANSFER",
            HandoffState::Finalizing => "FINALIZING",
            HandoffState::Done => "DONE",
            HandoffState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, HandoffState::Done | HandoffState::Failed)
    }

    /// Legal forward edges. `file` skips destination resolution; `tcp` goes straight to transfer.
    pub fn can_transition_to(&self, next: HandoffState) -> bool {
        use HandoffState::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Validating, ResolvingDestination)
                | (Validating, Provisioning)
                | (Validating, AwaitingTransfer)
                | (ResolvingDestination, Provisioning)
                | (Provisioning, AwaitingTransfer)
                | (AwaitingTransfer, Finalizing)
                | (Finalizing, Done)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: HandoffState,
    pub to: HandoffState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// In-memory record of one handoff's state history.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionJournal {
    pub handoff_id: Uuid,
    pub instance_id: String,
    pub current: HandoffState,
    pub transitions: Vec<Transition>,
    pub started_at: DateTime<Utc>,
}

impl TransitionJournal {
    pub fn new(instance_id: &str) -> Self {
        Self {
            handoff_id: Uuid::new_v4(),
            instance_id: instance_id.to_string(),
            current: HandoffState::Validating,
            transitions: Vec::new(),
            started_at: Utc::now(),
        }
    }

    /// Transition to `to` (idempotent). Returns false and leaves the state untouched
    /// when the edge is not legal.
    pub fn advance(&mut self, to: HandoffState, reason: &str) -> bool {
        if self.current == to {
            return false;
        }
        if !self.current.can_transition_to(to) {
            tracing::warn!(
                handoff_id = %self.handoff_id,
                instance_id = %self.instance_id,
                "[handoff] illegal transition {} -> {} ({})",
                self.current.as_str(),
                to.as_str(),
                reason
            );
            return false;
        }
        tracing::info!(
            handoff_id = %self.handoff_id,
            instance_id = %self.instance_id,
            "[handoff] {} -> {}: {}",
            self.current.as_str(),
            to.as_str(),
            reason
        );
        self.transitions.push(Transition {
            from: self.current,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.current = to;
        true
    }

    pub fn fail(&mut self, reason: &str) -> bool {
        self.advance(HandoffState::Failed, reason)
    }

    pub fn path(&self) -> Vec<HandoffState> {
        let mut path = vec![HandoffState::Validating];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

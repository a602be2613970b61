use crate::handoff::{Choice, PromptId};
use crate::identity::Identity;
use serde::Serialize;

/// Session state-machine violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotError {
    #[error("slot already owned by {owner}; a hand-off must be negotiated")]
    AlreadyOwned { owner: Identity },
    #[error("slot is idle")]
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error(
        "cannot reduce to {requested} slots while {active} are active; retry with force to end them"
    )]
    CapacityReductionBlocked { requested: usize, active: usize },
    #[error("capacity must be at least 1")]
    InvalidCapacity,
    #[error("{identity} already holds slot {}", .slot + 1)]
    AlreadyHolding { identity: Identity, slot: usize },
    #[error("slot no longer exists")]
    UnknownSlot,
}

/// Persistence port failures.
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persistence task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("no pending prompt {0}")]
    NotFound(PromptId),
    #[error("{0} may not answer this prompt")]
    NotAddressee(Identity),
    #[error("choice {0:?} is not offered by this prompt")]
    ChoiceNotOffered(Choice),
}

/// Everything a transport can get back from the tracker.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Stats error: {0}")]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("{0} does not own a slot")]
    NotOwner(Identity),
    #[error("{0} is not an administrator")]
    NotAdmin(Identity),
    #[error("Bad command: {0}")]
    Command(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// Transports render errors as plain strings
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

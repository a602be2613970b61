use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Stable slot handle. Positions shift when the pool shrinks, ids never do.
pub type SlotId = u64;

/// Everything that exists only while a slot is owned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenure {
    pub owner: Identity,
    pub started_at: DateTime<Utc>,
    /// Elapsed seconds already credited for this tenure.
    pub accounted_secs: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active(Tenure),
}

/// One row of a status listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    /// Zero-based position in the pool.
    pub slot_index: usize,
    pub owner: Option<Identity>,
    pub started_at: Option<DateTime<Utc>>,
    pub label: Option<String>,
}

impl SlotStatus {
    pub fn is_active(&self) -> bool {
        self.owner.is_some()
    }
}

/// Result of a pool resize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResizeReport {
    pub from: usize,
    pub to: usize,
    pub removed_idle: usize,
    /// Tenures ended to reach the target, tail first.
    pub force_ended: Vec<Tenure>,
}

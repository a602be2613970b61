use super::types::{SessionState, SlotId, SlotStatus, Tenure};
use crate::error::SlotError;
use crate::identity::Identity;
use crate::stats::StatsStore;
use chrono::{DateTime, Utc};
use tracing::debug;

/// A single server slot and whoever currently owns it.
///
/// `Idle → Active → Idle`. Owner, start time, accounted seconds and label
/// all live inside [`Tenure`], so a half-populated slot cannot exist.
#[derive(Debug, Clone)]
pub struct SlotSession {
    id: SlotId,
    state: SessionState,
}

impl SlotSession {
    pub fn new(id: SlotId) -> Self {
        Self {
            id,
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn tenure(&self) -> Option<&Tenure> {
        match &self.state {
            SessionState::Active(tenure) => Some(tenure),
            SessionState::Idle => None,
        }
    }

    pub fn owner(&self) -> Option<&Identity> {
        self.tenure().map(|t| &t.owner)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SessionState::Idle)
    }

    /// Begin a new tenure.
    ///
    /// An active slot is only taken over with `overwrite`, which ends the
    /// previous tenure without accruing it; the ended tenure is returned.
    pub fn start(
        &mut self,
        owner: Identity,
        label: impl Into<String>,
        overwrite: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Tenure>, SlotError> {
        if let (SessionState::Active(tenure), false) = (&self.state, overwrite) {
            return Err(SlotError::AlreadyOwned {
                owner: tenure.owner.clone(),
            });
        }
        let previous = if self.is_idle() { None } else { Some(self.end()?) };

        self.state = SessionState::Active(Tenure {
            owner,
            started_at: now,
            accounted_secs: 0,
            label: label.into(),
        });
        Ok(previous)
    }

    /// Credit the owner with the seconds elapsed since the last accrual.
    ///
    /// `delta = elapsed - accounted * (forced ? 0.1 : 1)`, evaluated in tenths
    /// of a second and floored to whole seconds. Non-positive deltas are
    /// ignored. Returns the seconds credited.
    pub fn accrue(&mut self, forced: bool, now: DateTime<Utc>, stats: &StatsStore) -> u64 {
        let SessionState::Active(tenure) = &mut self.state else {
            return 0;
        };

        let elapsed = (now - tenure.started_at).num_seconds();
        let accounted_tenths = tenure.accounted_secs as i64 * if forced { 1 } else { 10 };
        let delta_tenths = elapsed.saturating_mul(10) - accounted_tenths;
        if delta_tenths <= 0 {
            return 0;
        }

        let credited = (delta_tenths / 10) as u64;
        if credited > 0 {
            stats.credit(&tenure.owner, credited);
        }
        tenure.accounted_secs = elapsed as u64;

        debug!(
            "Accrued slot {} for {}: +{credited}s (elapsed {elapsed}s, forced {forced})",
            self.id, tenure.owner
        );
        credited
    }

    /// Return to idle. Callers accrue first or the unaccounted time is lost.
    pub fn end(&mut self) -> Result<Tenure, SlotError> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Active(tenure) => Ok(tenure),
            SessionState::Idle => Err(SlotError::Idle),
        }
    }

    pub fn status(&self, slot_index: usize) -> SlotStatus {
        let tenure = self.tenure();
        SlotStatus {
            slot_index,
            owner: tenure.map(|t| t.owner.clone()),
            started_at: tenure.map(|t| t.started_at),
            label: tenure.map(|t| t.label.clone()),
        }
    }
}

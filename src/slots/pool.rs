use super::session::SlotSession;
use super::types::{ResizeReport, SlotId, SlotStatus, Tenure};
use crate::error::{AppError, PoolError};
use crate::identity::Identity;
use crate::stats::StatsStore;
use chrono::{DateTime, Utc};
use tracing::info;

/// Ordered, resizable set of slots. Never empty.
///
/// An identity owns at most one slot across the whole pool; [`claim`] is the
/// only way in and refuses a second slot.
///
/// [`claim`]: SlotPool::claim
#[derive(Debug)]
pub struct SlotPool {
    sessions: Vec<SlotSession>,
    next_id: SlotId,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let mut pool = Self {
            sessions: Vec::with_capacity(capacity),
            next_id: 0,
        };
        pool.grow_to(capacity);
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| !s.is_idle()).count()
    }

    pub fn sessions(&self) -> &[SlotSession] {
        &self.sessions
    }

    pub fn get(&self, index: usize) -> Option<&SlotSession> {
        self.sessions.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut SlotSession> {
        self.sessions.get_mut(index)
    }

    pub fn index_of(&self, slot: SlotId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id() == slot)
    }

    /// Position of the slot owned by `identity`, if any.
    pub fn find_by_owner(&self, identity: &Identity) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.owner() == Some(identity))
    }

    /// First idle slot; failing that, the slot held longest.
    pub fn find_first_free(&self) -> Option<usize> {
        self.find_idle().or_else(|| {
            self.sessions
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.tenure().map(|t| (i, t.started_at)))
                .min_by_key(|(_, started_at)| *started_at)
                .map(|(i, _)| i)
        })
    }

    pub fn find_idle(&self) -> Option<usize> {
        self.sessions.iter().position(|s| s.is_idle())
    }

    /// Active slots with their tenures, longest held first.
    pub fn active_oldest_first(&self) -> Vec<(SlotId, Tenure)> {
        let mut active: Vec<(SlotId, Tenure)> = self
            .sessions
            .iter()
            .filter_map(|s| s.tenure().map(|t| (s.id(), t.clone())))
            .collect();
        active.sort_by_key(|(_, t)| t.started_at);
        active
    }

    /// Start a tenure on an idle slot. Returns the slot's position.
    pub fn claim(
        &mut self,
        slot: SlotId,
        owner: Identity,
        label: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        if let Some(held) = self.find_by_owner(&owner) {
            return Err(PoolError::AlreadyHolding {
                identity: owner,
                slot: held,
            }
            .into());
        }
        let index = self.index_of(slot).ok_or(PoolError::UnknownSlot)?;
        self.sessions[index].start(owner, label, false, now)?;
        Ok(index)
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.sessions
            .iter()
            .enumerate()
            .map(|(i, s)| s.status(i))
            .collect()
    }

    /// Grow or shrink to `capacity` slots.
    ///
    /// Shrinking drops idle slots from the highest position down, then ends
    /// active slots from the tail with a forced accrual. Ending anything
    /// requires `force`; without it the pool is left untouched.
    pub fn resize(
        &mut self,
        capacity: usize,
        force: bool,
        now: DateTime<Utc>,
        stats: &StatsStore,
    ) -> Result<ResizeReport, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }

        let from = self.sessions.len();
        let mut report = ResizeReport {
            from,
            to: capacity,
            removed_idle: 0,
            force_ended: Vec::new(),
        };

        if capacity >= from {
            self.grow_to(capacity);
            if capacity > from {
                info!("Pool grown from {from} to {capacity} slots");
            }
            return Ok(report);
        }

        let idle: Vec<usize> = self
            .sessions
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, s)| s.is_idle())
            .map(|(i, _)| i)
            .collect();
        let removable_idle = idle.len().min(from - capacity);
        let must_end = from - removable_idle - capacity;

        if must_end > 0 && !force {
            return Err(PoolError::CapacityReductionBlocked {
                requested: capacity,
                active: self.active_count(),
            });
        }

        // Descending positions stay valid while removing
        for index in idle.into_iter().take(removable_idle) {
            self.sessions.remove(index);
        }
        report.removed_idle = removable_idle;

        while self.sessions.len() > capacity {
            let Some(mut session) = self.sessions.pop() else {
                break;
            };
            session.accrue(true, now, stats);
            if let Ok(tenure) = session.end() {
                info!(
                    "Slot {} force-ended for {} during resize",
                    self.sessions.len() + 1,
                    tenure.owner
                );
                report.force_ended.push(tenure);
            }
        }

        info!(
            "Pool shrunk from {from} to {capacity} slots ({} idle removed, {} ended)",
            report.removed_idle,
            report.force_ended.len()
        );
        Ok(report)
    }

    fn grow_to(&mut self, capacity: usize) {
        while self.sessions.len() < capacity {
            self.sessions.push(SlotSession::new(self.next_id));
            self.next_id += 1;
        }
    }
}

use super::prompts::{Choice, PromptKind, PromptOutcome};
use crate::error::{AppError, PoolError};
use crate::identity::Identity;
use crate::slots::{SlotId, SlotPool, Tenure};
use crate::state::{AppState, StartOutcome};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info};

const OWNER_CHOICES: [Choice; 3] = [Choice::Overwrite, Choice::End, Choice::Ignore];
const ADMIN_CHOICES: [Choice; 1] = [Choice::Overwrite];

/// How a slot changed hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transfer {
    /// Owner ended voluntarily; full credit.
    Ended,
    /// Owner or an administrator chose overwrite.
    Overwritten,
    /// Nobody answered in time.
    TimedOut,
}

impl Transfer {
    /// Whether the outgoing owner's last accrual takes the forced discount.
    pub fn forced(self) -> bool {
        !matches!(self, Transfer::Ended)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Transfer(Transfer),
    /// Leave this owner alone and ask the next one.
    Next,
}

/// Map one owner's answer to stop-or-continue.
pub fn decide(outcome: &PromptOutcome) -> Decision {
    match outcome {
        PromptOutcome::Answered { choice, .. } => match choice {
            Choice::End => Decision::Transfer(Transfer::Ended),
            Choice::Overwrite => Decision::Transfer(Transfer::Overwritten),
            Choice::Ignore | Choice::Confirm => Decision::Next,
        },
        PromptOutcome::TimedOut => Decision::Transfer(Transfer::TimedOut),
    }
}

/// A slot as it looked when the negotiation began.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub slot: SlotId,
    pub tenure: Tenure,
}

impl Candidate {
    fn still_holds(&self, pool: &SlotPool) -> Option<usize> {
        let index = pool.index_of(self.slot)?;
        let tenure = pool.get(index)?.tenure()?;
        (tenure.owner == self.tenure.owner && tenure.started_at == self.tenure.started_at)
            .then_some(index)
    }
}

/// Walks the owners of a full pool, oldest tenure first, until one gives way.
///
/// No lock is held while an owner is being asked. Every step re-reads the
/// pool, so owners who leave, slots that disappear and slots that free up
/// mid-negotiation are all handled.
pub struct HandoffNegotiator<'a> {
    state: &'a AppState,
    requester: Identity,
    label: String,
    candidates: VecDeque<Candidate>,
}

impl<'a> HandoffNegotiator<'a> {
    pub fn new(
        state: &'a AppState,
        requester: Identity,
        label: String,
        active: Vec<(SlotId, Tenure)>,
    ) -> Self {
        let mut candidates: Vec<Candidate> = active
            .into_iter()
            .map(|(slot, tenure)| Candidate { slot, tenure })
            .collect();
        candidates.sort_by_key(|c| c.tenure.started_at);

        Self {
            state,
            requester,
            label,
            candidates: candidates.into(),
        }
    }

    pub async fn run(mut self) -> Result<StartOutcome, AppError> {
        info!(
            "{} negotiating for a slot with {} owners",
            self.requester,
            self.candidates.len()
        );

        while let Some(candidate) = self.candidates.pop_front() {
            if let Some(outcome) = self.claim_idle()? {
                return Ok(outcome);
            }

            let held = candidate.still_holds(&self.state.pool());
            let Some(slot_index) = held else {
                debug!("Skipping slot {}: owner changed", candidate.slot);
                continue;
            };

            let owner = candidate.tenure.owner.clone();
            let outcome = self
                .state
                .ask(
                    PromptKind::Handoff {
                        slot_index,
                        owner: owner.clone(),
                    },
                    &self.requester,
                    &owner,
                    OWNER_CHOICES.to_vec(),
                    ADMIN_CHOICES.to_vec(),
                )
                .await;

            match decide(&outcome) {
                Decision::Next => {
                    info!("{owner} kept slot {}", slot_index + 1);
                }
                Decision::Transfer(transfer) => {
                    if transfer == Transfer::TimedOut {
                        info!("No answer from {owner}, taking over slot {}", slot_index + 1);
                    }
                    if let Some(outcome) = self.transfer(&candidate, transfer)? {
                        return Ok(outcome);
                    }
                }
            }
        }

        Ok(self.claim_idle()?.unwrap_or(StartOutcome::NoSlot))
    }

    fn ensure_requester_free(&self, pool: &SlotPool) -> Result<(), AppError> {
        match pool.find_by_owner(&self.requester) {
            Some(slot) => Err(PoolError::AlreadyHolding {
                identity: self.requester.clone(),
                slot,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Someone may have left while we were waiting.
    fn claim_idle(&self) -> Result<Option<StartOutcome>, AppError> {
        let slot_index = {
            let mut pool = self.state.pool();
            self.ensure_requester_free(&pool)?;
            let Some(slot) = pool.find_idle().and_then(|i| pool.get(i)).map(|s| s.id()) else {
                return Ok(None);
            };
            pool.claim(slot, self.requester.clone(), self.label.clone(), self.state.now())?
        };

        info!("{} took free slot {}", self.requester, slot_index + 1);
        self.state.notify();
        Ok(Some(StartOutcome::Started { slot_index }))
    }

    fn transfer(
        &self,
        candidate: &Candidate,
        transfer: Transfer,
    ) -> Result<Option<StartOutcome>, AppError> {
        let outcome = {
            let mut pool = self.state.pool();
            self.ensure_requester_free(&pool)?;
            let now = self.state.now();

            if let Some(index) = candidate.still_holds(&pool) {
                let session = pool.get_mut(index).ok_or(PoolError::UnknownSlot)?;
                let credited = session.accrue(transfer.forced(), now, &self.state.stats);
                let previous = session.end()?;
                let slot_index =
                    pool.claim(candidate.slot, self.requester.clone(), self.label.clone(), now)?;
                info!(
                    "Slot {} passed from {} to {} ({transfer:?}, +{credited}s)",
                    slot_index + 1,
                    previous.owner,
                    self.requester
                );
                StartOutcome::TookOver {
                    slot_index,
                    previous_owner: previous.owner,
                    transfer,
                    credited_secs: credited,
                }
            } else if pool
                .index_of(candidate.slot)
                .and_then(|i| pool.get(i))
                .is_some_and(|s| s.is_idle())
            {
                let slot_index =
                    pool.claim(candidate.slot, self.requester.clone(), self.label.clone(), now)?;
                info!("{} took vacated slot {}", self.requester, slot_index + 1);
                StartOutcome::Started { slot_index }
            } else {
                debug!("Slot {} changed hands during negotiation", candidate.slot);
                return Ok(None);
            }
        };

        self.state.notify();
        Ok(Some(outcome))
    }
}

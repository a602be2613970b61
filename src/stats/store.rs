use super::persister::Persister;
use super::snapshot::{Snapshot, SnapshotPort};
use crate::error::StatsError;
use crate::identity::Identity;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// In-memory totals. Opted-out identities keep their totals here; they are
/// only left out of snapshots and leaderboards.
#[derive(Debug, Default)]
struct Ledger {
    totals: HashMap<Identity, u64>,
    ignored: BTreeSet<Identity>,
}

impl Ledger {
    /// Fold a loaded snapshot in without ever lowering a total.
    fn merge(&mut self, snapshot: Snapshot) {
        for (identity, seconds) in snapshot.totals {
            let entry = self.totals.entry(identity).or_insert(0);
            *entry = (*entry).max(seconds);
        }
        self.ignored.extend(snapshot.ignored);
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            totals: self
                .totals
                .iter()
                .filter(|(id, _)| !self.ignored.contains(*id))
                .map(|(id, secs)| (id.clone(), *secs))
                .collect(),
            ignored: self.ignored.clone(),
        }
    }
}

/// Process-wide seconds-owned ledger.
///
/// Every mutation takes the ledger lock, applies the change and enqueues the
/// resulting snapshot before releasing it, so snapshots reach the persister
/// in mutation order.
pub struct StatsStore {
    ledger: Mutex<Ledger>,
    persister: Persister,
}

impl StatsStore {
    /// Load the existing snapshot (a missing one is an empty store) and start
    /// the persistence queue. Must be called inside a Tokio runtime.
    pub async fn open(port: Arc<dyn SnapshotPort>) -> Result<Arc<Self>, StatsError> {
        let loader = port.clone();
        let loaded = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| StatsError::Task(e.to_string()))??;

        let mut ledger = Ledger::default();
        if let Some(snapshot) = loaded {
            info!(
                "Loaded stats for {} identities ({} opted out)",
                snapshot.totals.len(),
                snapshot.ignored.len()
            );
            ledger.merge(snapshot);
        }

        Ok(Arc::new(Self {
            ledger: Mutex::new(ledger),
            persister: Persister::spawn(port),
        }))
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add seconds to an identity and persist. Returns the new total.
    pub fn credit(&self, identity: &Identity, seconds: u64) -> u64 {
        let mut ledger = self.ledger();
        let total = ledger.totals.entry(identity.clone()).or_insert(0);
        *total = total.saturating_add(seconds);
        let total = *total;
        debug!("Credited {identity} with {seconds}s (total {total}s)");
        self.persister.submit(ledger.snapshot());
        total
    }

    pub fn total(&self, identity: &Identity) -> u64 {
        self.ledger().totals.get(identity).copied().unwrap_or(0)
    }

    pub fn is_opted_out(&self, identity: &Identity) -> bool {
        self.ledger().ignored.contains(identity)
    }

    /// Flip the opt-out flag and persist. Returns true when now opted out.
    pub fn toggle_opt_out(&self, identity: &Identity) -> bool {
        let mut ledger = self.ledger();
        let opted_out = if ledger.ignored.remove(identity) {
            false
        } else {
            ledger.ignored.insert(identity.clone());
            true
        };
        info!("{identity} opted {}", if opted_out { "out" } else { "back in" });
        self.persister.submit(ledger.snapshot());
        opted_out
    }

    /// Highest totals first, ties by identity, opted-out identities skipped.
    pub fn leaderboard(&self, limit: usize) -> Vec<(Identity, u64)> {
        let ledger = self.ledger();
        let mut rows: Vec<(Identity, u64)> = ledger
            .totals
            .iter()
            .filter(|(id, _)| !ledger.ignored.contains(*id))
            .map(|(id, secs)| (id.clone(), *secs))
            .collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows.truncate(limit);
        rows
    }

    /// What would be written to disk right now.
    pub fn snapshot(&self) -> Snapshot {
        self.ledger().snapshot()
    }

    /// Enqueue the current snapshot.
    pub fn save(&self) {
        let ledger = self.ledger();
        self.persister.submit(ledger.snapshot());
    }

    pub async fn flush(&self) {
        self.persister.flush().await;
    }

    /// Persist the final state. Call before the process exits.
    pub async fn shutdown(&self) {
        self.save();
        self.flush().await;
        info!("Stats store flushed");
    }

    pub fn is_degraded(&self) -> bool {
        self.persister.is_degraded()
    }
}

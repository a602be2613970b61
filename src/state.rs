use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::error::{AppError, PoolError};
use crate::handoff::{
    Choice, HandoffNegotiator, Prompt, PromptBoard, PromptId, PromptKind, PromptOutcome, Transfer,
};
use crate::identity::Identity;
use crate::slots::{ResizeReport, SlotPool, SlotStatus};
use crate::stats::{JsonFile, StatsReport, StatsStore};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A free slot was available.
    Started { slot_index: usize },
    /// An owner gave way (or was overwritten).
    TookOver {
        slot_index: usize,
        previous_owner: Identity,
        transfer: Transfer,
        credited_secs: u64,
    },
    /// Every owner chose to keep their slot.
    NoSlot,
    /// The requester never confirmed the negotiation.
    NotConfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndOutcome {
    pub slot_index: usize,
    pub held_secs: u64,
    pub credited_secs: u64,
    pub total_secs: u64,
}

/// Shared tracker state: the slot pool, the stats ledger and pending prompts.
///
/// The pool lock is only ever held for short synchronous sections, never
/// across a prompt wait, so one negotiation does not stall other requests.
pub struct AppState {
    pool: Mutex<SlotPool>,
    pub(crate) stats: Arc<StatsStore>,
    prompts: PromptBoard,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    config: TrackerConfig,
}

impl AppState {
    pub fn new(
        config: TrackerConfig,
        stats: Arc<StatsStore>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, AppError> {
        config.validate()?;
        let pool = SlotPool::new(config.slots)?;

        Ok(Arc::new(Self {
            pool: Mutex::new(pool),
            stats,
            prompts: PromptBoard::new(),
            clock,
            transport,
            config,
        }))
    }

    /// Open the stats file named in the config and run on the system clock.
    pub async fn open(
        config: TrackerConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, AppError> {
        let stats = StatsStore::open(Arc::new(JsonFile::new(&config.stats_path))).await?;
        Self::new(config, stats, Arc::new(SystemClock), transport)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    pub(crate) fn pool(&self) -> MutexGuard<'_, SlotPool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn notify(&self) {
        let status = self.pool().status();
        self.transport.notify_pool_changed(&status);
    }

    /// Post a prompt through the transport and wait out the window.
    pub(crate) async fn ask(
        &self,
        kind: PromptKind,
        requester: &Identity,
        addressee: &Identity,
        choices: Vec<Choice>,
        admin_choices: Vec<Choice>,
    ) -> PromptOutcome {
        let window = self.config.prompt_window();
        let deadline = self.now()
            + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let prompt = Prompt {
            id: Uuid::new_v4(),
            kind,
            requester: requester.clone(),
            addressee: addressee.clone(),
            choices,
            admin_choices,
            deadline,
        };
        let id = prompt.id;

        let rx = self.prompts.post(prompt.clone());
        self.transport.prompt(&prompt);
        self.prompts.wait(id, rx, window).await
    }

    /// Bring the caller's own slot up to date, if they hold one.
    pub fn touch(&self, identity: &Identity) -> u64 {
        let now = self.now();
        let mut pool = self.pool();
        match pool.find_by_owner(identity).and_then(|i| pool.get_mut(i)) {
            Some(session) => session.accrue(false, now, &self.stats),
            None => 0,
        }
    }

    /// Claim a slot, negotiating with current owners when the pool is full.
    pub async fn request_start(
        &self,
        identity: &Identity,
        label: &str,
    ) -> Result<StartOutcome, AppError> {
        let candidates = {
            let mut pool = self.pool();
            if let Some(slot) = pool.find_by_owner(identity) {
                return Err(PoolError::AlreadyHolding {
                    identity: identity.clone(),
                    slot,
                }
                .into());
            }

            let free = pool
                .find_first_free()
                .and_then(|i| pool.get(i))
                .filter(|s| s.is_idle())
                .map(|s| s.id());
            match free {
                Some(slot) => {
                    let slot_index = pool.claim(slot, identity.clone(), label, self.now())?;
                    drop(pool);
                    info!("{identity} started slot {} ({label})", slot_index + 1);
                    self.notify();
                    return Ok(StartOutcome::Started { slot_index });
                }
                None => pool.active_oldest_first(),
            }
        };

        if self.config.require_confirmation {
            let outcome = self
                .ask(
                    PromptKind::ConfirmHandoff,
                    identity,
                    identity,
                    vec![Choice::Confirm],
                    Vec::new(),
                )
                .await;
            if !matches!(outcome, PromptOutcome::Answered { .. }) {
                info!("{identity} did not confirm the hand-off");
                return Ok(StartOutcome::NotConfirmed);
            }
        }

        HandoffNegotiator::new(self, identity.clone(), label.to_string(), candidates)
            .run()
            .await
    }

    pub fn request_status(&self) -> Vec<SlotStatus> {
        self.pool().status()
    }

    /// End the caller's tenure with full credit.
    pub fn request_end(&self, identity: &Identity) -> Result<EndOutcome, AppError> {
        let outcome = {
            let now = self.now();
            let mut pool = self.pool();
            let slot_index = pool
                .find_by_owner(identity)
                .ok_or_else(|| AppError::NotOwner(identity.clone()))?;
            let session = pool.get_mut(slot_index).ok_or(PoolError::UnknownSlot)?;
            let credited_secs = session.accrue(false, now, &self.stats);
            let tenure = session.end()?;

            EndOutcome {
                slot_index,
                held_secs: (now - tenure.started_at).num_seconds().max(0) as u64,
                credited_secs,
                total_secs: self.stats.total(identity),
            }
        };

        info!(
            "{identity} ended slot {} after {}s",
            outcome.slot_index + 1,
            outcome.held_secs
        );
        self.notify();
        Ok(outcome)
    }

    pub fn request_stats(&self, identity: &Identity) -> StatsReport {
        self.touch(identity);
        StatsReport::build(&self.stats, identity, self.config.leaderboard_size)
    }

    /// Returns true when the identity is now opted out.
    pub fn toggle_opt_out(&self, identity: &Identity) -> bool {
        self.touch(identity);
        self.stats.toggle_opt_out(identity)
    }

    pub fn resize_pool(&self, capacity: usize, force: bool) -> Result<ResizeReport, AppError> {
        let report = {
            let now = self.now();
            self.pool().resize(capacity, force, now, &self.stats)?
        };
        self.notify();
        Ok(report)
    }

    /// Answer a pending prompt on behalf of `responder`.
    pub fn respond(
        &self,
        prompt: PromptId,
        responder: &Identity,
        choice: Choice,
    ) -> Result<(), AppError> {
        let is_admin = self.config.is_admin(responder);
        self.prompts.respond(prompt, responder, is_admin, choice)?;
        Ok(())
    }

    pub fn pending_prompts(&self) -> Vec<Prompt> {
        self.prompts.pending()
    }

    /// Credit every active owner up to now and flush stats to disk.
    pub async fn shutdown(&self) {
        {
            let now = self.now();
            let mut pool = self.pool();
            for index in 0..pool.len() {
                if let Some(session) = pool.get_mut(index) {
                    session.accrue(false, now, &self.stats);
                }
            }
        }
        self.stats.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::PromptError;
    use crate::stats::snapshot::testing::MemoryPort;
    use crate::transport::testing::RecordingTransport;
    use chrono::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        state: Arc<AppState>,
        clock: Arc<ManualClock>,
        transport: Arc<RecordingTransport>,
        prompts: mpsc::UnboundedReceiver<Prompt>,
    }

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    fn config(slots: usize) -> TrackerConfig {
        TrackerConfig {
            slots,
            prompt_timeout_ms: 2_000,
            require_confirmation: false,
            admins: vec![id("mod")],
            ..TrackerConfig::default()
        }
    }

    async fn harness_with(config: TrackerConfig, stats: Arc<StatsStore>) -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let (transport, prompts) = RecordingTransport::new();
        let transport = Arc::new(transport);
        let state = AppState::new(config, stats, clock.clone(), transport.clone()).unwrap();
        Harness {
            state,
            clock,
            transport,
            prompts,
        }
    }

    async fn harness(config: TrackerConfig) -> Harness {
        let stats = StatsStore::open(Arc::new(MemoryPort::default()))
            .await
            .unwrap();
        harness_with(config, stats).await
    }

    fn spawn_start(
        state: &Arc<AppState>,
        who: &str,
        label: &str,
    ) -> tokio::task::JoinHandle<Result<StartOutcome, AppError>> {
        let state = state.clone();
        let who = id(who);
        let label = label.to_string();
        tokio::spawn(async move { state.request_start(&who, &label).await })
    }

    fn assert_exclusive(state: &AppState) {
        let status = state.request_status();
        let mut owners: Vec<&Identity> = status.iter().filter_map(|s| s.owner.as_ref()).collect();
        let total = owners.len();
        owners.sort();
        owners.dedup();
        assert_eq!(owners.len(), total, "an identity holds two slots: {status:?}");
    }

    #[tokio::test]
    async fn start_on_free_pool_shows_in_status() {
        let h = harness(config(1)).await;

        let outcome = h.state.request_start(&id("a"), "X7").await.unwrap();
        assert_eq!(outcome, StartOutcome::Started { slot_index: 0 });

        let status = h.state.request_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].owner, Some(id("a")));
        assert_eq!(status[0].label.as_deref(), Some("X7"));
        assert_eq!(status[0].started_at, Some(t0()));
        assert_eq!(h.transport.notification_count(), 1);
    }

    #[tokio::test]
    async fn owner_ending_hands_over_with_full_credit() {
        let mut h = harness(config(1)).await;
        h.state.request_start(&id("a"), "X7").await.unwrap();
        h.clock.advance(Duration::seconds(120));

        let pending = spawn_start(&h.state, "b", "Q1");
        let prompt = h.prompts.recv().await.unwrap();
        assert_eq!(prompt.addressee, id("a"));
        assert_eq!(prompt.requester, id("b"));
        assert_eq!(
            prompt.kind,
            PromptKind::Handoff {
                slot_index: 0,
                owner: id("a")
            }
        );

        h.state.respond(prompt.id, &id("a"), Choice::End).unwrap();
        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            StartOutcome::TookOver {
                slot_index: 0,
                previous_owner: id("a"),
                transfer: Transfer::Ended,
                credited_secs: 120,
            }
        );
        assert_eq!(h.state.stats().total(&id("a")), 120);

        let status = h.state.request_status();
        assert_eq!(status[0].owner, Some(id("b")));
        assert_eq!(status[0].label.as_deref(), Some("Q1"));
        assert_eq!(status[0].started_at, Some(t0() + Duration::seconds(120)));
    }

    #[tokio::test]
    async fn silent_owner_is_overwritten_with_discount() {
        let mut h = harness(TrackerConfig {
            prompt_timeout_ms: 30,
            ..config(1)
        })
        .await;
        h.state.request_start(&id("a"), "X7").await.unwrap();

        h.clock.advance(Duration::seconds(100));
        assert_eq!(h.state.touch(&id("a")), 100);
        h.clock.advance(Duration::seconds(100));

        let outcome = h.state.request_start(&id("b"), "Q1").await.unwrap();
        assert_eq!(
            outcome,
            StartOutcome::TookOver {
                slot_index: 0,
                previous_owner: id("a"),
                transfer: Transfer::TimedOut,
                credited_secs: 190,
            }
        );
        assert_eq!(h.state.stats().total(&id("a")), 290);
        assert_eq!(h.state.request_status()[0].owner, Some(id("b")));
        // The unanswered prompt was withdrawn
        assert!(h.prompts.try_recv().is_ok());
        assert!(h.state.pending_prompts().is_empty());
    }

    #[tokio::test]
    async fn owners_are_asked_oldest_first_and_may_ignore() {
        let mut h = harness(config(2)).await;
        h.clock.set(t0() + Duration::seconds(10));
        h.state.request_start(&id("a"), "A").await.unwrap();
        h.clock.set(t0());
        h.state.request_start(&id("c"), "C").await.unwrap();
        h.clock.set(t0() + Duration::seconds(60));

        let pending = spawn_start(&h.state, "b", "B");

        let first = h.prompts.recv().await.unwrap();
        assert_eq!(first.addressee, id("c"));
        h.state.respond(first.id, &id("c"), Choice::Ignore).unwrap();

        let second = h.prompts.recv().await.unwrap();
        assert_eq!(second.addressee, id("a"));
        h.state.respond(second.id, &id("a"), Choice::End).unwrap();

        let outcome = pending.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::TookOver {
                slot_index: 0,
                transfer: Transfer::Ended,
                credited_secs: 50,
                ..
            }
        ));
        assert_eq!(h.state.request_status()[1].owner, Some(id("c")));
        assert_exclusive(&h.state);
    }

    #[tokio::test]
    async fn everyone_ignoring_yields_no_slot() {
        let mut h = harness(config(1)).await;
        h.state.request_start(&id("a"), "X7").await.unwrap();

        let pending = spawn_start(&h.state, "b", "Q1");
        let prompt = h.prompts.recv().await.unwrap();
        h.state.respond(prompt.id, &id("a"), Choice::Ignore).unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), StartOutcome::NoSlot);
        assert_eq!(h.state.request_status()[0].owner, Some(id("a")));
    }

    #[tokio::test]
    async fn admin_overwrite_applies_discount() {
        let mut h = harness(config(1)).await;
        h.state.request_start(&id("a"), "X7").await.unwrap();
        h.clock.advance(Duration::seconds(40));

        let pending = spawn_start(&h.state, "b", "Q1");
        let prompt = h.prompts.recv().await.unwrap();

        let err = h.state.respond(prompt.id, &id("mod"), Choice::End).unwrap_err();
        assert!(matches!(err, AppError::Prompt(PromptError::NotAddressee(_))));
        h.state
            .respond(prompt.id, &id("mod"), Choice::Overwrite)
            .unwrap();

        let outcome = pending.await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::TookOver {
                transfer: Transfer::Overwritten,
                credited_secs: 40,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn owner_leaving_during_wait_frees_the_slot() {
        let mut h = harness(TrackerConfig {
            prompt_timeout_ms: 50,
            ..config(1)
        })
        .await;
        h.state.request_start(&id("a"), "X7").await.unwrap();
        h.clock.advance(Duration::seconds(30));

        let pending = spawn_start(&h.state, "b", "Q1");
        let _prompt = h.prompts.recv().await.unwrap();

        // Served while the negotiation is suspended
        let ended = h.state.request_end(&id("a")).unwrap();
        assert_eq!(ended.credited_secs, 30);

        let outcome = pending.await.unwrap().unwrap();
        assert_eq!(outcome, StartOutcome::Started { slot_index: 0 });
        assert_eq!(h.state.stats().total(&id("a")), 30);
        assert_eq!(h.state.request_status()[0].owner, Some(id("b")));
    }

    #[tokio::test]
    async fn unconfirmed_request_does_not_negotiate() {
        let mut h = harness(TrackerConfig {
            prompt_timeout_ms: 30,
            require_confirmation: true,
            ..config(1)
        })
        .await;
        h.state.request_start(&id("a"), "X7").await.unwrap();

        let outcome = h.state.request_start(&id("b"), "Q1").await.unwrap();
        assert_eq!(outcome, StartOutcome::NotConfirmed);

        let confirm = h.prompts.try_recv().unwrap();
        assert_eq!(confirm.kind, PromptKind::ConfirmHandoff);
        assert_eq!(confirm.addressee, id("b"));
        assert!(h.prompts.try_recv().is_err(), "owner must not be asked");
        assert_eq!(h.state.request_status()[0].owner, Some(id("a")));
    }

    #[tokio::test]
    async fn confirmed_request_walks_the_owners() {
        let mut h = harness(TrackerConfig {
            require_confirmation: true,
            ..config(1)
        })
        .await;
        h.state.request_start(&id("a"), "X7").await.unwrap();

        let pending = spawn_start(&h.state, "b", "Q1");
        let confirm = h.prompts.recv().await.unwrap();
        assert!(h.state.respond(confirm.id, &id("a"), Choice::Confirm).is_err());
        h.state.respond(confirm.id, &id("b"), Choice::Confirm).unwrap();

        let ask = h.prompts.recv().await.unwrap();
        h.state.respond(ask.id, &id("a"), Choice::End).unwrap();
        assert!(matches!(
            pending.await.unwrap().unwrap(),
            StartOutcome::TookOver { .. }
        ));
    }

    #[tokio::test]
    async fn second_slot_for_same_identity_is_refused() {
        let h = harness(config(2)).await;
        h.state.request_start(&id("a"), "X7").await.unwrap();

        let err = h.state.request_start(&id("a"), "X8").await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Pool(PoolError::AlreadyHolding { slot: 0, .. })
        ));
        assert!(h.state.request_status()[1].owner.is_none());
    }

    #[tokio::test]
    async fn end_requires_ownership() {
        let h = harness(config(1)).await;
        let err = h.state.request_end(&id("a")).unwrap_err();
        assert!(matches!(err, AppError::NotOwner(_)));
    }

    #[tokio::test]
    async fn start_end_sequences_keep_owners_exclusive() {
        let h = harness(TrackerConfig {
            prompt_timeout_ms: 10,
            ..config(3)
        })
        .await;
        let people = ["a", "b", "c", "d"];

        for round in 0..12usize {
            let who = id(people[round % people.len()]);
            h.clock.advance(Duration::seconds(7));
            if h.state.request_end(&who).is_err() {
                let _ = h.state.request_start(&who, "code").await;
            }
            assert_exclusive(&h.state);
            let totals: Vec<u64> = people.iter().map(|p| h.state.stats().total(&id(p))).collect();
            assert!(totals.iter().all(|t| *t <= 12 * 7));
        }
    }

    #[tokio::test]
    async fn resize_through_state_notifies_transport() {
        let h = harness(config(3)).await;
        h.state.request_start(&id("a"), "A").await.unwrap();
        h.state.request_start(&id("b"), "B").await.unwrap();
        let before = h.transport.notification_count();

        let err = h.state.resize_pool(1, false).unwrap_err();
        assert!(matches!(
            err,
            AppError::Pool(PoolError::CapacityReductionBlocked { .. })
        ));
        assert_eq!(h.state.request_status().len(), 3);
        assert_eq!(h.transport.notification_count(), before);

        h.clock.advance(Duration::seconds(10));
        let report = h.state.resize_pool(1, true).unwrap();
        assert_eq!(report.removed_idle, 1);
        assert_eq!(report.force_ended.len(), 1);
        assert_eq!(h.state.request_status().len(), 1);
        assert_eq!(h.state.stats().total(&id("b")), 10);
        assert_eq!(h.transport.notification_count(), before + 1);
    }

    #[tokio::test]
    async fn opt_out_round_trip_through_stats_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("serverStats.json");
        let stats = StatsStore::open(Arc::new(JsonFile::new(&path))).await.unwrap();
        let h = harness_with(config(1), stats).await;

        h.state.request_start(&id("a"), "X7").await.unwrap();
        h.clock.advance(Duration::seconds(3600));
        h.state.request_end(&id("a")).unwrap();

        assert!(h.state.toggle_opt_out(&id("a")));
        h.state.stats().flush().await;
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved.get("a").is_none());
        assert_eq!(saved["_ignored"], serde_json::json!(["a"]));
        assert!(h.state.request_stats(&id("z")).leaderboard.is_empty());

        assert!(!h.state.toggle_opt_out(&id("a")));
        h.state.stats().flush().await;
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["a"], 3600);
        assert_eq!(saved["_ignored"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn shutdown_credits_active_owners_and_flushes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("serverStats.json");
        let stats = StatsStore::open(Arc::new(JsonFile::new(&path))).await.unwrap();
        let h = harness_with(config(1), stats).await;

        h.state.request_start(&id("a"), "X7").await.unwrap();
        h.clock.advance(Duration::seconds(75));
        h.state.shutdown().await;

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["a"], 75);
    }

    #[tokio::test]
    async fn stats_request_refreshes_callers_total() {
        let h = harness(config(1)).await;
        h.state.request_start(&id("a"), "X7").await.unwrap();
        h.clock.advance(Duration::seconds(600));

        let report = h.state.request_stats(&id("a"));
        assert_eq!(report.caller_seconds, 600);
        assert_eq!(report.leaderboard[0].identity, id("a"));
        assert_eq!(report.leaderboard[0].display, "10 minutes");
    }
}

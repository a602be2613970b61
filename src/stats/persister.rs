use super::snapshot::{Snapshot, SnapshotPort};
use crate::error::StatsError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

const RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_ATTEMPTS: usize = 2;

enum PersistRequest {
    Save(Snapshot),
    Flush(oneshot::Sender<()>),
}

/// Single writer queue in front of a [`SnapshotPort`].
///
/// Saves are fire-and-forget for callers. Queued saves collapse into the
/// newest snapshot, a failed write is retried once, and a flush resolves
/// only after every save submitted before it has been attempted.
pub(crate) struct Persister {
    tx: mpsc::UnboundedSender<PersistRequest>,
    degraded: Arc<AtomicBool>,
}

impl Persister {
    pub fn spawn(port: Arc<dyn SnapshotPort>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let degraded = Arc::new(AtomicBool::new(false));
        tokio::spawn(run(port, rx, degraded.clone()));
        Self { tx, degraded }
    }

    pub fn submit(&self, snapshot: Snapshot) {
        if self.tx.send(PersistRequest::Save(snapshot)).is_err() {
            warn!("Stats persistence queue closed, snapshot dropped");
        }
    }

    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(PersistRequest::Flush(ack)).is_err() {
            return;
        }
        let _ = done.await;
    }

    /// True once a write has failed all its attempts, until the next success.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }
}

async fn run(
    port: Arc<dyn SnapshotPort>,
    mut rx: mpsc::UnboundedReceiver<PersistRequest>,
    degraded: Arc<AtomicBool>,
) {
    while let Some(request) = rx.recv().await {
        match request {
            PersistRequest::Save(mut snapshot) => {
                let mut flush_ack = None;
                loop {
                    match rx.try_recv() {
                        Ok(PersistRequest::Save(newer)) => snapshot = newer,
                        Ok(PersistRequest::Flush(ack)) => {
                            flush_ack = Some(ack);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                let ok = write_with_retry(&port, snapshot).await;
                degraded.store(!ok, Ordering::SeqCst);

                if let Some(ack) = flush_ack {
                    let _ = ack.send(());
                }
            }
            PersistRequest::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn write_with_retry(port: &Arc<dyn SnapshotPort>, snapshot: Snapshot) -> bool {
    let snapshot = Arc::new(snapshot);

    for attempt in 1..=MAX_ATTEMPTS {
        let port = port.clone();
        let snap = snapshot.clone();
        let result = tokio::task::spawn_blocking(move || port.save(&snap))
            .await
            .map_err(|e| StatsError::Task(e.to_string()))
            .and_then(|r| r);

        match result {
            Ok(()) => {
                debug!("Saved stats snapshot ({} entries)", snapshot.totals.len());
                return true;
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!("Stats save failed (attempt {attempt}), retrying: {e}");
                tokio::time::sleep(RETRY_DELAY).await;
            }
            Err(e) => {
                error!("Stats save failed, serving in-memory totals only: {e}");
            }
        }
    }

    false
}

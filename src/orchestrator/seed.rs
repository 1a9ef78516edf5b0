//! One-shot hand-off of user-placed seed points into a suspended run.

use crate::model::SeedPoints;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Raised by the UI once the user confirms their markers. Only the first
/// submission reaches the run.
#[derive(Debug, Clone)]
pub struct SeedPointTrigger {
    tx: Arc<Mutex<Option<oneshot::Sender<SeedPoints>>>>,
}

impl SeedPointTrigger {
    /// Returns `false` if seed points were already submitted or the run is gone.
    pub fn submit(&self, seeds: SeedPoints) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(seeds).is_ok(),
            None => false,
        }
    }
}

/// Awaited by the orchestrator; resolves at most once per run.
#[derive(Debug)]
pub struct SeedPointListener {
    rx: Mutex<Option<oneshot::Receiver<SeedPoints>>>,
}

impl SeedPointListener {
    /// Wait, without timeout, for the trigger. Returns `None` if the trigger
    /// was dropped unused or the listener was already consumed.
    pub async fn wait(&self) -> Option<SeedPoints> {
        let rx = self.rx.lock().take()?;
        rx.await.ok()
    }
}

pub fn seed_point_channel() -> (SeedPointTrigger, SeedPointListener) {
    let (tx, rx) = oneshot::channel();
    (
        SeedPointTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        SeedPointListener {
            rx: Mutex::new(Some(rx)),
        },
    )
}

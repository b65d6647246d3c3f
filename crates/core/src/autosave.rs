//! Periodic draft autosave.
//!
//! The task is owned by whoever hosts the session. It is started at session entry and stopped
//! at teardown (reset, completion or shutdown). Each tick takes the session lock, so it always
//! sees a draft either before or after a user action, never part-way through one. The snapshot
//! write runs on the blocking pool.

use crate::workflow::EnrollmentSession;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub type SharedSession = Arc<Mutex<EnrollmentSession>>;

/// Handle to a running autosave loop.
#[derive(Debug)]
pub struct AutosaveTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl AutosaveTask {
    /// Spawns the loop on the current tokio runtime. The first tick fires after `every`.
    pub fn start(session: SharedSession, every: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(interval_secs = every.as_secs(), "autosave started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let session = session.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || tick(&session)).await {
                            tracing::warn!(error = %e, "autosave tick failed");
                        }
                    }
                }
            }
            tracing::debug!("autosave stopped");
        });

        Self { shutdown, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "autosave task ended abnormally");
        }
    }
}

fn tick(session: &SharedSession) {
    let mut session = session.lock().unwrap_or_else(|p| p.into_inner());
    match session.autosave() {
        None => tracing::debug!("autosave tick: no changes"),
        Some(Ok(receipt)) => tracing::debug!(saved_at = %receipt.saved_at, "autosave tick: saved"),
        // save_draft already logged the failure
        Some(Err(_)) => {}
    }
}

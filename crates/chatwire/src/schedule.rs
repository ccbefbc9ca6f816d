// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Proactive refresh timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ChatError, ErrorCode};
use crate::refresh::TokenRefresher;
use crate::token::{epoch_ms, Credential};

/// Outcome of a timer-driven refresh.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Refreshed(Credential),
    Failed { error: String, code: ErrorCode },
}

/// Delay before refreshing a credential expiring at `expires_at` (epoch
/// seconds): `max(expires_at - now - margin, min_delay)`.
pub fn delay_until_refresh(expires_at: u64, now_ms: u64, margin: Duration, min_delay: Duration) -> Duration {
    let deadline_ms = expires_at.saturating_mul(1000).saturating_sub(margin.as_millis() as u64);
    Duration::from_millis(deadline_ms.saturating_sub(now_ms)).max(min_delay)
}

struct RefreshTimer {
    cancel: CancellationToken,
    /// Epoch milliseconds.
    scheduled_for: u64,
    generation: u64,
}

/// Owns at most one outstanding refresh timer.
pub struct RefreshScheduler {
    refresher: Arc<TokenRefresher>,
    margin: Duration,
    min_delay: Duration,
    timer: Mutex<Option<RefreshTimer>>,
    generation: AtomicU64,
    events: broadcast::Sender<SchedulerEvent>,
}

impl RefreshScheduler {
    pub fn new(refresher: Arc<TokenRefresher>, margin: Duration, min_delay: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            refresher,
            margin,
            min_delay,
            timer: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Arm the timer for `credential`, replacing any existing one.
    pub fn schedule(self: &Arc<Self>, credential: &Credential) {
        let delay = delay_until_refresh(credential.expires_at(), epoch_ms(), self.margin, self.min_delay);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let scheduled_for = epoch_ms() + delay.as_millis() as u64;

        let previous = self.timer.lock().replace(RefreshTimer { cancel: cancel.clone(), scheduled_for, generation });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        debug!(delay_ms = delay.as_millis() as u64, generation, "refresh timer armed");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.fire(generation).await;
        });
    }

    /// Disarm the timer. A refresh already past its deadline keeps running.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel.cancel();
            debug!(generation = timer.generation, "refresh timer cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.timer.lock().as_ref().is_some_and(|t| !t.cancel.is_cancelled())
    }

    /// Epoch milliseconds at which the armed timer fires.
    pub fn scheduled_for(&self) -> Option<u64> {
        self.timer.lock().as_ref().map(|t| t.scheduled_for)
    }

    async fn fire(self: Arc<Self>, generation: u64) {
        {
            let mut timer = self.timer.lock();
            if timer.as_ref().is_some_and(|t| t.generation == generation) {
                *timer = None;
            }
        }

        match self.refresher.refresh_stored().await {
            Ok(cred) => {
                // Superseded by a later schedule() or cancel(): the stored
                // credential is already updated, leave the rest to the caller.
                if self.generation.load(Ordering::SeqCst) != generation {
                    debug!(generation, "proactive refresh superseded");
                    return;
                }
                self.schedule(&cred);
                info!(expires_in = cred.expires_in_secs(), "proactive refresh succeeded");
                let _ = self.events.send(SchedulerEvent::Refreshed(cred));
            }
            Err(e) => self.publish_failure(&e),
        }
    }

    fn publish_failure(&self, error: &ChatError) {
        warn!(code = %error.code(), "proactive refresh failed: {error}");
        let _ = self.events.send(SchedulerEvent::Failed { error: error.to_string(), code: error.code() });
    }
}

#[cfg(test)]
#[path = "schedule_tests.rs"]
mod tests;

use crate::domain::EntryStatus;
use crate::metrics::Metrics;
use crate::store::WaitlistStore;
use crate::waitlist::OfferScheduler;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Work sent to the expiry loop by armed offer timers.
#[derive(Debug)]
pub enum ExpiryCommand {
    ExpireOffer { event_id: String, entry_id: String },
}

/// Settles lapsed offers and cascades the freed capacity to the next
/// waiting entry.
///
/// Two trigger paths converge here: per-offer timers, and a periodic sweep
/// that catches offers whose timers were lost (a restart, a dropped
/// channel). Both reduce to the same compare-and-set, so a doubly delivered
/// expiry is a no-op.
pub struct ExpiryHandler {
    store: Arc<dyn WaitlistStore>,
    scheduler: Arc<OfferScheduler>,
    sweep_interval: Duration,
    metrics: Arc<Metrics>,
}

impl ExpiryHandler {
    pub fn new(
        store: Arc<dyn WaitlistStore>,
        scheduler: Arc<OfferScheduler>,
        sweep_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            scheduler,
            sweep_interval,
            metrics,
        }
    }

    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<ExpiryCommand>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        // The first tick fires immediately, which settles offers orphaned by
        // the previous process before any new work is taken.
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("expiry handler running, sweep interval {:?}", self.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("expiry handler shutting down");
                    break;
                }

                command = commands.recv() => {
                    match command {
                        Some(ExpiryCommand::ExpireOffer { event_id, entry_id }) => {
                            if let Err(e) = self.expire_offer(&event_id, &entry_id).await {
                                error!("failed to expire offer {} for event {}: {}", entry_id, event_id, e);
                            }
                        }
                        None => break,
                    }
                }

                _ = sweep.tick() => {
                    if let Err(e) = self.cleanup_expired_offers().await {
                        error!("offer sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// Scheduled expiry for a single offer. Settled entries are left alone.
    pub async fn expire_offer(&self, event_id: &str, entry_id: &str) -> Result<()> {
        let expired = self.store.transition_entry(
            event_id,
            entry_id,
            EntryStatus::Offered,
            EntryStatus::Expired,
            None,
        )?;

        if !expired {
            debug!("entry {} already settled, nothing to expire", entry_id);
            return Ok(());
        }

        self.metrics.offers_expired.inc();
        info!("offer for entry {} (event {}) expired", entry_id, event_id);

        // Cascade: the freed capacity goes to the next waiting entry.
        self.scheduler.process_queue(event_id).await
    }

    /// Fail-safe sweep over every event's overdue offers. Returns how many
    /// offers it settled.
    pub async fn cleanup_expired_offers(&self) -> Result<usize> {
        let overdue = self.store.overdue_offers(Utc::now())?;
        if overdue.is_empty() {
            return Ok(0);
        }

        let mut by_event: HashMap<String, Vec<String>> = HashMap::new();
        for entry in overdue {
            by_event.entry(entry.event_id).or_default().push(entry.entry_id);
        }

        let mut settled = 0;
        for (event_id, entry_ids) in by_event {
            for entry_id in entry_ids {
                let expired = self.store.transition_entry(
                    &event_id,
                    &entry_id,
                    EntryStatus::Offered,
                    EntryStatus::Expired,
                    None,
                )?;
                if expired {
                    settled += 1;
                    self.metrics.offers_expired.inc();
                }
            }
            self.scheduler.process_queue(&event_id).await?;
        }

        if settled > 0 {
            warn!("offer sweep settled {} overdue offers missed by timers", settled);
        }
        Ok(settled)
    }
}

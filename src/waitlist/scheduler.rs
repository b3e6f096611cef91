use crate::config::OfferConfig;
use crate::domain::{EntryStatus, WaitingListEntry};
use crate::metrics::Metrics;
use crate::store::WaitlistStore;
use crate::waitlist::{CapacityAccountant, ExpiryCommand};
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

/// Promotes waiting entries into time-boxed purchase offers.
///
/// A per-event mutex makes promotion single-writer per event; capacity is
/// still recomputed from committed state on every call, so the operation is
/// idempotent and safe to trigger from any number of places at once.
pub struct OfferScheduler {
    store: Arc<dyn WaitlistStore>,
    accountant: CapacityAccountant,
    offer_ttl: chrono::Duration,
    expiry_tx: mpsc::UnboundedSender<ExpiryCommand>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: Arc<Metrics>,
}

impl OfferScheduler {
    pub fn new(
        store: Arc<dyn WaitlistStore>,
        offer: &OfferConfig,
        expiry_tx: mpsc::UnboundedSender<ExpiryCommand>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            accountant: CapacityAccountant::new(store.clone()),
            store,
            offer_ttl: offer.ttl(),
            expiry_tx,
            locks: DashMap::new(),
            metrics,
        }
    }

    /// Promote as many waiting entries as current capacity allows, oldest
    /// first, arming an expiry timer for each promotion.
    pub async fn process_queue(&self, event_id: &str) -> Result<()> {
        let lock = self.event_lock(event_id);
        let _guard = lock.lock().await;

        let capacity = self.accountant.available_capacity(event_id)?;
        if capacity.is_exhausted() {
            return Ok(());
        }
        let mut budget = capacity.budget();

        let now = Utc::now();
        let waiting = self
            .store
            .entries_for_event(event_id)?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Waiting);

        for entry in waiting {
            let cost = entry.quantity as i64;
            if cost > budget {
                // Strict FIFO: a request that does not fit blocks the queue
                // rather than letting smaller requests jump it.
                break;
            }

            let expires_at = now + self.offer_ttl;
            let promoted = self.store.transition_entry(
                event_id,
                &entry.entry_id,
                EntryStatus::Waiting,
                EntryStatus::Offered,
                Some(expires_at),
            )?;
            if !promoted {
                continue;
            }

            budget -= cost;
            self.metrics.offers_extended.inc();
            info!(
                "offered {} tickets to user {} (entry {}, event {}), expires {}",
                entry.quantity, entry.user_id, entry.entry_id, event_id, expires_at
            );
            self.arm_expiry(&entry, expires_at);
        }

        Ok(())
    }

    fn event_lock(&self, event_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(event_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn arm_expiry(&self, entry: &WaitingListEntry, expires_at: DateTime<Utc>) {
        let tx = self.expiry_tx.clone();
        let event_id = entry.event_id.clone();
        let entry_id = entry.entry_id.clone();
        tokio::spawn(async move {
            let delay = expires_at
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
            // A closed channel means the expiry loop is gone; the sweep on
            // the next process start settles the offer instead.
            let _ = tx.send(ExpiryCommand::ExpireOffer { event_id, entry_id });
        });
    }
}

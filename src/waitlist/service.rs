use crate::config::LobbyConfig;
use crate::dispatch::ReservationProcessor;
use crate::domain::{
    Capacity, EntryStatus, Event, QueuePosition, ReservationRequest, Ticket, WaitingListEntry,
};
use crate::metrics::Metrics;
use crate::store::WaitlistStore;
use crate::waitlist::{CapacityAccountant, ExpiryHandler, OfferScheduler, PositionCalculator};
use crate::{LobbyError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Facade over the waiting-list state machine: joins, promotion, release,
/// purchase, and position queries. Starting it also starts the expiry loop.
pub struct WaitlistService {
    store: Arc<dyn WaitlistStore>,
    scheduler: Arc<OfferScheduler>,
    accountant: CapacityAccountant,
    positions: PositionCalculator,
    expiry_shutdown: broadcast::Sender<()>,
    metrics: Arc<Metrics>,
}

impl WaitlistService {
    pub fn start(
        store: Arc<dyn WaitlistStore>,
        config: &LobbyConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(OfferScheduler::new(
            store.clone(),
            &config.offer,
            expiry_tx,
            metrics.clone(),
        ));

        let handler = Arc::new(ExpiryHandler::new(
            store.clone(),
            scheduler.clone(),
            config.offer.sweep_interval(),
            metrics.clone(),
        ));

        let (expiry_shutdown, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(handler.run(expiry_rx, shutdown_rx));

        Arc::new(Self {
            accountant: CapacityAccountant::new(store.clone()),
            positions: PositionCalculator::new(store.clone()),
            store,
            scheduler,
            expiry_shutdown,
            metrics,
        })
    }

    /// Interface to the external event catalogue: seed or replace an event.
    pub fn register_event(&self, event: Event) -> Result<Event> {
        info!(
            "registered event {} ({}) with capacity {}",
            event.event_id,
            event.name,
            event.capacity()
        );
        self.store.put_event(event.clone())?;
        Ok(event)
    }

    pub fn event(&self, event_id: &str) -> Result<Event> {
        self.store
            .event(event_id)?
            .ok_or_else(|| LobbyError::not_found(format!("event {}", event_id)))
    }

    pub fn available_capacity(&self, event_id: &str) -> Result<Capacity> {
        self.accountant.available_capacity(event_id)
    }

    /// Put a buyer on the waiting list. A user with a live entry gets that
    /// entry back instead of a second place in line. Promotion runs before
    /// returning, so a buyer joining an open event sees an offer right away.
    pub async fn join_waitlist(
        &self,
        event_id: &str,
        user_id: &str,
        ticket_type_id: &str,
        quantity: u32,
    ) -> Result<WaitingListEntry> {
        if quantity == 0 {
            return Err(LobbyError::InvalidArgument(
                "quantity must be at least 1".to_string(),
            ));
        }
        self.event(event_id)?;

        if let Some(existing) = self.store.active_entry_for_user(event_id, user_id)? {
            debug!(
                "user {} already holds entry {} for event {}",
                user_id, existing.entry_id, event_id
            );
            return Ok(existing);
        }

        let entry = WaitingListEntry::new(event_id, user_id, ticket_type_id, quantity);
        self.store.insert_entry(entry.clone())?;
        self.metrics.entries_joined.inc();
        info!(
            "user {} joined waiting list for event {} (entry {}, {} tickets)",
            user_id, event_id, entry.entry_id, quantity
        );

        self.scheduler.process_queue(event_id).await?;

        // The entry may already have been promoted.
        Ok(self.store.entry(event_id, &entry.entry_id)?.unwrap_or(entry))
    }

    /// Idempotent promotion trigger.
    pub async fn process_queue(&self, event_id: &str) -> Result<()> {
        self.scheduler.process_queue(event_id).await
    }

    pub fn queue_position(&self, event_id: &str, user_id: &str) -> Result<Option<QueuePosition>> {
        self.positions.queue_position(event_id, user_id)
    }

    /// Buyer-initiated release: a fast-path expiry that immediately hands
    /// the capacity to the next entry in line.
    pub async fn release_reservation(
        &self,
        event_id: &str,
        entry_id: &str,
    ) -> Result<WaitingListEntry> {
        let entry = self
            .store
            .entry(event_id, entry_id)?
            .ok_or_else(|| LobbyError::not_found(format!("entry {}", entry_id)))?;

        match entry.status {
            EntryStatus::Waiting | EntryStatus::Offered => {
                let released = self.store.transition_entry(
                    event_id,
                    entry_id,
                    entry.status,
                    EntryStatus::Expired,
                    None,
                )?;
                if released {
                    self.metrics.offers_released.inc();
                    info!("entry {} (event {}) released by the buyer", entry_id, event_id);
                    self.scheduler.process_queue(event_id).await?;
                }
            }
            EntryStatus::Expired | EntryStatus::Purchased => {
                debug!("entry {} already settled, release is a no-op", entry_id);
            }
        }

        self.store
            .entry(event_id, entry_id)?
            .ok_or_else(|| LobbyError::not_found(format!("entry {}", entry_id)))
    }

    /// Completion hook for the payment collaborator: converts a live offer
    /// into issued tickets.
    pub async fn complete_purchase(
        &self,
        event_id: &str,
        entry_id: &str,
    ) -> Result<WaitingListEntry> {
        let entry = self
            .store
            .entry(event_id, entry_id)?
            .ok_or_else(|| LobbyError::not_found(format!("entry {}", entry_id)))?;

        if !entry.has_active_offer(Utc::now()) {
            return Err(LobbyError::InvalidArgument(format!(
                "entry {} holds no active offer",
                entry_id
            )));
        }

        let purchased = self.store.transition_entry(
            event_id,
            entry_id,
            EntryStatus::Offered,
            EntryStatus::Purchased,
            None,
        )?;
        if !purchased {
            return Err(LobbyError::InvalidArgument(format!(
                "entry {} holds no active offer",
                entry_id
            )));
        }

        for _ in 0..entry.quantity {
            self.store
                .put_ticket(Ticket::issue(event_id, &entry.ticket_type_id))?;
        }
        self.metrics.purchases_completed.inc();
        info!(
            "entry {} (event {}) purchased {} tickets",
            entry_id, event_id, entry.quantity
        );

        self.store
            .entry(event_id, entry_id)?
            .ok_or_else(|| LobbyError::not_found(format!("entry {}", entry_id)))
    }

    /// Stops the expiry loop.
    pub fn stop(&self) {
        let _ = self.expiry_shutdown.send(());
    }
}

#[async_trait]
impl ReservationProcessor for WaitlistService {
    async fn process(&self, request: &ReservationRequest) -> Result<serde_json::Value> {
        let entry = self
            .join_waitlist(
                &request.event_id,
                &request.user_id,
                &request.ticket_type_id,
                request.quantity,
            )
            .await?;
        let position = self.queue_position(&request.event_id, &request.user_id)?;

        Ok(serde_json::json!({
            "entry_id": entry.entry_id,
            "status": entry.status,
            "offer_expires_at": entry.offer_expires_at,
            "position": position.map(|p| p.position),
        }))
    }
}

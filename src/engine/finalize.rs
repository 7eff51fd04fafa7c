use async_trait::async_trait;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::validate::{now_ms, validate_details};
use super::{Engine, EngineError};

/// What the payment provider reported for a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Succeeded(BookingDetails),
    Failed,
    Canceled,
}

/// What a payment callback did to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Booked(Ulid),
    /// Hold released; `false` if it had already ended.
    Released(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub slot_id: Ulid,
    pub token: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Hold expiry at the moment the session is created.
    pub expires_at: Ms,
}

/// An external payment provider. Returns the opaque client secret the
/// customer's browser needs to complete checkout.
#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn create_session(&self, req: &CheckoutRequest) -> Result<String, String>;
}

impl Engine {
    pub async fn commit(
        &self,
        slot_id: Ulid,
        token: Ulid,
        details: BookingDetails,
    ) -> Result<Ulid, EngineError> {
        self.commit_at(slot_id, token, details, now_ms()).await
    }

    /// Turn an active hold into a booking.
    ///
    /// A redelivered commit carrying the same `client_ref` for the same slot
    /// returns the booking it already produced.
    pub async fn commit_at(
        &self,
        slot_id: Ulid,
        token: Ulid,
        details: BookingDetails,
        now: Ms,
    ) -> Result<Ulid, EngineError> {
        validate_details(&details)?;
        if let Some(existing) = self.booking_for_ref(slot_id, details.client_ref.as_deref()) {
            return Ok(existing);
        }

        let Some(mut rec) = self.lock_slot(slot_id).await else {
            return Err(EngineError::HoldNotFound(slot_id));
        };
        // Re-check under the lock: a concurrent redelivery may have won.
        if let Some(existing) = self.booking_for_ref(slot_id, details.client_ref.as_deref()) {
            return Ok(existing);
        }

        if rec.active_hold(token).is_some() && self.expire_if_lapsed(&mut rec, now).await? {
            metrics::counter!(observability::COMMITS_REJECTED_TOTAL).increment(1);
            return Err(EngineError::HoldExpired(slot_id));
        }
        if rec.active_hold(token).is_none() {
            metrics::counter!(observability::COMMITS_REJECTED_TOTAL).increment(1);
            return match rec.ended_state(token) {
                Some(HoldState::Expired) => Err(EngineError::HoldExpired(slot_id)),
                _ => Err(EngineError::HoldNotFound(slot_id)),
            };
        }

        let booking_id = Ulid::new();
        let event = Event::BookingCommitted {
            booking_id,
            slot_id,
            token,
            booked_at: now,
            details,
        };
        self.persist_and_apply(&mut rec, &event).await?;

        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        info!("booking {booking_id} committed on slot {slot_id}");
        Ok(booking_id)
    }

    fn booking_for_ref(&self, slot_id: Ulid, client_ref: Option<&str>) -> Option<Ulid> {
        let booking_id = *self.booking_refs.get(client_ref?)?;
        self.bookings
            .get(&booking_id)
            .filter(|b| b.slot_id == slot_id)
            .map(|b| b.id)
    }

    /// Payment confirmation callback.
    pub async fn on_payment_outcome(
        &self,
        slot_id: Ulid,
        token: Ulid,
        outcome: PaymentOutcome,
    ) -> Result<Settlement, EngineError> {
        match outcome {
            PaymentOutcome::Succeeded(details) => {
                self.commit(slot_id, token, details).await.map(Settlement::Booked)
            }
            other @ (PaymentOutcome::Failed | PaymentOutcome::Canceled) => {
                info!("payment for slot {slot_id} did not complete ({other:?}); releasing hold");
                self.release(slot_id, token).await.map(Settlement::Released)
            }
        }
    }

    /// Extend the hold and open a checkout session for it.
    pub async fn begin_checkout(
        &self,
        provider: &dyn CheckoutProvider,
        slot_id: Ulid,
        token: Ulid,
    ) -> Result<String, EngineError> {
        let expires_at = self.extend(slot_id, token).await?;
        let span = match self.slot(&slot_id) {
            Some(slot) => slot.read().await.span,
            None => return Err(EngineError::HoldNotFound(slot_id)),
        };

        let req = CheckoutRequest {
            slot_id,
            token,
            start: span.start,
            end: span.end,
            expires_at,
        };
        provider.create_session(&req).await.map_err(|e| {
            warn!("checkout session for slot {slot_id} failed: {e}");
            EngineError::PaymentProvider(e)
        })
    }

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    pub fn list_bookings(&self) -> Vec<Booking> {
        let mut out: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }
}

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::validate::now_ms;
use super::{Engine, EngineError};

impl Engine {
    pub async fn acquire(&self, slot_id: Ulid) -> Result<HoldGrant, EngineError> {
        self.acquire_at(slot_id, now_ms()).await
    }

    /// Check-and-set Open → Held under the slot's write lock. Unknown,
    /// Held and Booked slots all answer `SlotUnavailable`.
    pub async fn acquire_at(&self, slot_id: Ulid, now: Ms) -> Result<HoldGrant, EngineError> {
        let Some(mut rec) = self.lock_slot(slot_id).await else {
            return Err(EngineError::SlotUnavailable(slot_id));
        };
        self.expire_if_lapsed(&mut rec, now).await?;
        if !rec.is_open() {
            metrics::counter!(observability::HOLDS_CONTENDED_TOTAL).increment(1);
            return Err(EngineError::SlotUnavailable(slot_id));
        }

        let token = Ulid::new();
        let expires_at = now + self.settings.lease_ms;
        let event = Event::HoldAcquired {
            slot_id,
            token,
            issued_at: now,
            expires_at,
        };
        self.persist_and_apply(&mut rec, &event).await?;

        metrics::counter!(observability::HOLDS_ACQUIRED_TOTAL).increment(1);
        debug!("hold {token} on slot {slot_id} until {expires_at}");
        Ok(HoldGrant {
            slot_id,
            token,
            expires_at,
        })
    }

    pub async fn extend(&self, slot_id: Ulid, token: Ulid) -> Result<Ms, EngineError> {
        self.extend_at(slot_id, token, now_ms()).await
    }

    /// Heartbeat: push the lease out to `now + lease`.
    pub async fn extend_at(&self, slot_id: Ulid, token: Ulid, now: Ms) -> Result<Ms, EngineError> {
        let Some(mut rec) = self.lock_slot(slot_id).await else {
            return Err(EngineError::HoldNotFound(slot_id));
        };
        self.expire_if_lapsed(&mut rec, now).await?;
        if rec.active_hold(token).is_none() {
            return Err(EngineError::HoldNotFound(slot_id));
        }

        let expires_at = now + self.settings.lease_ms;
        let event = Event::HoldExtended {
            slot_id,
            token,
            expires_at,
        };
        self.persist_and_apply(&mut rec, &event).await?;
        metrics::counter!(observability::HOLDS_EXTENDED_TOTAL).increment(1);
        Ok(expires_at)
    }

    /// End a matching hold as Released. `false` when there is nothing to
    /// release.
    pub async fn release(&self, slot_id: Ulid, token: Ulid) -> Result<bool, EngineError> {
        let Some(mut rec) = self.lock_slot(slot_id).await else {
            return Ok(false);
        };
        if rec.active_hold(token).is_none() {
            return Ok(false);
        }
        let event = Event::HoldEnded {
            slot_id,
            token,
            state: HoldState::Released,
        };
        self.persist_and_apply(&mut rec, &event).await?;
        metrics::counter!(observability::HOLDS_RELEASED_TOTAL).increment(1);
        debug!("hold {token} on slot {slot_id} released");
        Ok(true)
    }

    /// Slots whose hold has lapsed. Slots locked right now are skipped; the
    /// next sweep or the lock holder's own lazy check gets them.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<Ulid> {
        self.slots
            .iter()
            .filter_map(|entry| {
                let rec = entry.value().try_read().ok()?;
                rec.hold.filter(|h| h.is_lapsed(now)).map(|_| rec.id)
            })
            .collect()
    }

    /// End every lapsed hold as Expired. Returns how many were ended.
    pub async fn expire_sweep(&self, now: Ms) -> usize {
        let mut expired = 0;
        for slot_id in self.collect_expired_holds(now) {
            let Some(mut rec) = self.lock_slot(slot_id).await else {
                continue;
            };
            match self.expire_if_lapsed(&mut rec, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!("expiry of hold on slot {slot_id} failed: {e}"),
            }
        }
        if expired > 0 {
            info!(expired, "expired abandoned holds");
        }
        expired
    }

    /// Persist expiry of a lapsed hold. Caller holds the slot's write lock.
    pub(super) async fn expire_if_lapsed(
        &self,
        rec: &mut SlotRecord,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let Some(hold) = rec.hold.filter(|h| h.is_lapsed(now)) else {
            return Ok(false);
        };
        let event = Event::HoldEnded {
            slot_id: rec.id,
            token: hold.token,
            state: HoldState::Expired,
        };
        self.persist_and_apply(rec, &event).await?;
        metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(1);
        debug!("hold {} on slot {} expired", hold.token, rec.id);
        Ok(true)
    }

    pub async fn list_holds(&self) -> Vec<HoldInfo> {
        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for slot in slots {
            let rec = slot.read().await;
            if let Some(hold) = rec.hold {
                out.push(HoldInfo {
                    slot_id: rec.id,
                    token: hold.token,
                    start: rec.span.start,
                    end: rec.span.end,
                    issued_at: hold.issued_at,
                    expires_at: hold.expires_at,
                });
            }
        }
        out.sort_by_key(|h| (h.start, h.slot_id));
        out
    }
}

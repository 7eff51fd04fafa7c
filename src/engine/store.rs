use std::collections::HashSet;

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::expand::{RecurrenceRule, expand_in};
use super::timeconv::{parse_tz, to_absolute};
use super::validate::{now_ms, validate_instant};
use super::{Engine, EngineError};

/// An availability request as an admin enters it: local wall-clock times in
/// a named zone plus a recurrence rule.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub start: String,
    pub end: Option<String>,
    pub tz: String,
    pub rule: RecurrenceRule,
}

impl Engine {
    pub async fn generate_availability(&self, req: &GenerateRequest) -> Result<usize, EngineError> {
        self.generate_availability_at(req, now_ms()).await
    }

    /// Convert, expand and insert. Returns the number of new slots.
    pub async fn generate_availability_at(
        &self,
        req: &GenerateRequest,
        now: Ms,
    ) -> Result<usize, EngineError> {
        let start = to_absolute(&req.start, &req.tz)?;
        let end = req
            .end
            .as_deref()
            .map(|e| to_absolute(e, &req.tz))
            .transpose()?;
        validate_instant(start)?;
        if start < now {
            return Err(EngineError::InvalidRange("availability cannot start in the past"));
        }

        let tz = parse_tz(&req.tz)?;
        let candidates = expand_in(start, end, &req.rule, &tz)?;
        if let Some(last) = candidates.iter().map(|s| s.end).max() {
            validate_instant(last)?;
        }
        self.insert_many(&candidates).await
    }

    /// Persist every candidate whose start is not already taken. Duplicates,
    /// against the store or within the batch, are skipped silently.
    pub async fn insert_many(&self, candidates: &[Span]) -> Result<usize, EngineError> {
        if candidates.iter().any(|s| s.duration_ms() != SLOT_MS) {
            return Err(EngineError::InvalidRange("slots are exactly 30 minutes"));
        }
        let _admin = self.admin.lock().await;

        let mut seen = HashSet::with_capacity(candidates.len());
        let fresh: Vec<(Ulid, Span)> = candidates
            .iter()
            .filter(|s| !self.starts.contains_key(&s.start) && seen.insert(s.start))
            .map(|s| (Ulid::new(), *s))
            .collect();

        if fresh.is_empty() {
            return Ok(0);
        }
        if self.slots.len() + fresh.len() > MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }

        self.wal_append(&Event::SlotsAdded { slots: fresh.clone() })
            .await?;
        self.apply_added(&fresh);

        let added = fresh.len();
        metrics::counter!(observability::SLOTS_GENERATED_TOTAL).increment(added as u64);
        metrics::gauge!(observability::SLOTS_LIVE).set(self.slots.len() as f64);
        info!(
            added,
            skipped = candidates.len() - added,
            "availability generated"
        );
        Ok(added)
    }

    /// Delete Open slots by id. Unknown ids are ignored. If any named slot is
    /// Held or Booked nothing is deleted.
    pub async fn delete_by_ids(&self, ids: &[Ulid]) -> Result<DeleteOutcome, EngineError> {
        if ids.len() > MAX_DELETE_IDS {
            return Err(EngineError::LimitExceeded("too many ids in one delete"));
        }
        let _admin = self.admin.lock().await;

        let mut wanted: Vec<Ulid> = ids.to_vec();
        wanted.sort();
        wanted.dedup();

        let guards = self.lock_open_candidates(&wanted, now_ms()).await?;
        if let Some(blocked) = guards.iter().find(|g| !g.is_open()) {
            return Err(EngineError::SlotNotDeletable(blocked.id));
        }
        self.remove_locked(guards).await
    }

    /// Delete Open slots starting in `[start, end)`; Held and Booked ones in
    /// range are left in place and counted as skipped.
    pub async fn delete_by_range(&self, start: Ms, end: Ms) -> Result<DeleteOutcome, EngineError> {
        if end <= start {
            return Err(EngineError::InvalidRange("end must be after start"));
        }
        let range = Span::new(start, end);
        self.delete_where(|t| range.contains_instant(t)).await
    }

    /// Delete every Open slot.
    pub async fn delete_all(&self) -> Result<DeleteOutcome, EngineError> {
        self.delete_where(|_| true).await
    }

    async fn delete_where(&self, keep_start: impl Fn(Ms) -> bool) -> Result<DeleteOutcome, EngineError> {
        let _admin = self.admin.lock().await;

        let mut ids: Vec<Ulid> = self
            .starts
            .iter()
            .filter(|e| keep_start(*e.key()))
            .map(|e| *e.value())
            .collect();
        ids.sort();

        let (open, blocked): (Vec<_>, Vec<_>) = self
            .lock_open_candidates(&ids, now_ms())
            .await?
            .into_iter()
            .partition(|g| g.is_open());
        drop(blocked);

        let mut outcome = self.remove_locked(open).await?;
        outcome.skipped = ids.len() - outcome.deleted;
        Ok(outcome)
    }

    /// Lock each id that still exists (in id order), expiring lapsed holds on
    /// the way so an abandoned checkout does not block a delete.
    async fn lock_open_candidates(
        &self,
        ids: &[Ulid],
        now: Ms,
    ) -> Result<Vec<OwnedRwLockWriteGuard<SlotRecord>>, EngineError> {
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut guard) = self.lock_slot(*id).await {
                self.expire_if_lapsed(&mut guard, now).await?;
                guards.push(guard);
            }
        }
        Ok(guards)
    }

    /// Caller holds the admin lock; every guard is an Open slot.
    async fn remove_locked(
        &self,
        guards: Vec<OwnedRwLockWriteGuard<SlotRecord>>,
    ) -> Result<DeleteOutcome, EngineError> {
        if guards.is_empty() {
            return Ok(DeleteOutcome::default());
        }
        let ids: Vec<Ulid> = guards.iter().map(|g| g.id).collect();
        self.wal_append(&Event::SlotsRemoved { ids }).await?;
        for guard in &guards {
            self.forget_slot(guard.id, guard.span.start);
        }

        let deleted = guards.len();
        metrics::counter!(observability::SLOTS_DELETED_TOTAL).increment(deleted as u64);
        metrics::gauge!(observability::SLOTS_LIVE).set(self.slots.len() as f64);
        debug!(deleted, "slots deleted");
        Ok(DeleteOutcome { deleted, skipped: 0 })
    }

    /// Every live slot ordered by start, after sweeping lapsed holds.
    pub async fn list(&self, now: Ms) -> Vec<SlotInfo> {
        self.expire_sweep(now).await;

        let slots: Vec<_> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            let rec = slot.read().await;
            out.push(SlotInfo {
                id: rec.id,
                start: rec.span.start,
                end: rec.span.end,
                state: rec.state,
                hold_expires_at: rec.hold.map(|h| h.expires_at),
            });
        }
        out.sort_by_key(|s| (s.start, s.id));
        out
    }
}

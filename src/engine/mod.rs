mod error;
mod expand;
mod finalize;
mod holds;
mod store;
mod timeconv;
mod validate;

pub use error::EngineError;
pub use expand::{Frequency, RecurrenceRule, expand, expand_in};
pub use finalize::{CheckoutProvider, CheckoutRequest, PaymentOutcome, Settlement};
pub use store::GenerateRequest;
pub use timeconv::{format_local, from_absolute, parse_tz, to_absolute};
pub use validate::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::warn;
use ulid::Ulid;

use crate::limits::MAX_HOLD_HISTORY;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedSlot = Arc<RwLock<SlotRecord>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Waits for one append, drains whatever else is already
/// queued, and commits the lot with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![first];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so no half-written bytes carry over
    // into the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long a hold lives without a heartbeat.
    pub lease_ms: Ms,
    /// Extra WAL append attempts before a storage error is surfaced.
    pub storage_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lease_ms: 30_000,
            storage_retries: 3,
        }
    }
}

impl EngineSettings {
    /// Suggested client heartbeat period, well inside the lease.
    pub fn heartbeat_ms(&self) -> Ms {
        (self.lease_ms / 3).max(1)
    }
}

/// The single calendar: slots, their holds and the bookings made on them.
pub struct Engine {
    pub(super) slots: DashMap<Ulid, SharedSlot>,
    /// `start` → slot id; enforces one live slot per start instant.
    pub(super) starts: DashMap<Ms, Ulid>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    /// Payment reference → booking id.
    pub(super) booking_refs: DashMap<String, Ulid>,
    /// Serializes store-wide mutations (insert, delete, compaction).
    pub(super) admin: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) settings: EngineSettings,
}

impl Engine {
    pub fn new(wal_path: PathBuf, settings: EngineSettings) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            slots: DashMap::new(),
            starts: DashMap::new(),
            bookings: DashMap::new(),
            booking_refs: DashMap::new(),
            admin: Mutex::new(()),
            wal_tx,
            settings,
        };

        // Sole owner of every lock during replay, so try_* always succeeds.
        for event in &events {
            match event {
                Event::SlotsAdded { slots } => engine.apply_added(slots),
                Event::SlotsRemoved { ids } => {
                    for id in ids {
                        let start = engine
                            .slot(id)
                            .and_then(|s| s.try_read().ok().map(|g| g.span.start));
                        if let Some(start) = start {
                            engine.forget_slot(*id, start);
                        }
                    }
                }
                other => {
                    if let Some(slot) = other.slot_id().and_then(|id| engine.slot(&id))
                        && let Ok(mut guard) = slot.try_write()
                    {
                        engine.apply_slot_event(&mut guard, other);
                    }
                }
            }
        }

        metrics::gauge!(observability::SLOTS_LIVE).set(engine.slots.len() as f64);
        Ok(engine)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Write-lock a slot that is still in the store. A slot deleted while we
    /// waited for its lock comes back as `None`.
    pub(super) async fn lock_slot(&self, id: Ulid) -> Option<OwnedRwLockWriteGuard<SlotRecord>> {
        let slot = self.slot(&id)?;
        let guard = slot.write_owned().await;
        self.slots.contains_key(&id).then_some(guard)
    }

    async fn wal_append_once(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Durable append, retried with exponential backoff.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            match self.wal_append_once(event).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.settings.storage_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(10 << attempt.min(6));
                    warn!("WAL append failed (attempt {attempt}): {e}; retrying in {backoff:?}");
                    metrics::counter!(observability::STORAGE_RETRIES_TOTAL).increment(1);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// WAL-append then apply, with the slot lock already held by the caller.
    pub(super) async fn persist_and_apply(
        &self,
        rec: &mut SlotRecord,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_slot_event(rec, event);
        Ok(())
    }

    pub(super) fn apply_added(&self, slots: &[(Ulid, Span)]) {
        for &(id, span) in slots {
            self.slots
                .insert(id, Arc::new(RwLock::new(SlotRecord::new(id, span))));
            self.starts.insert(span.start, id);
        }
    }

    pub(super) fn forget_slot(&self, id: Ulid, start: Ms) {
        self.slots.remove(&id);
        self.starts.remove_if(&start, |_, owner| *owner == id);
    }

    /// Apply a per-slot event. Caller holds the slot's write lock.
    pub(super) fn apply_slot_event(&self, rec: &mut SlotRecord, event: &Event) {
        match event {
            Event::HoldAcquired {
                token,
                issued_at,
                expires_at,
                ..
            } => {
                rec.hold = Some(Hold {
                    token: *token,
                    issued_at: *issued_at,
                    expires_at: *expires_at,
                });
                rec.state = SlotState::Held;
            }
            Event::HoldExtended {
                token, expires_at, ..
            } => {
                if let Some(hold) = rec.hold.as_mut().filter(|h| h.token == *token) {
                    hold.expires_at = *expires_at;
                }
            }
            Event::HoldEnded { token, state, .. } => {
                if rec.active_hold(*token).is_some() {
                    rec.end_hold(*state, MAX_HOLD_HISTORY);
                }
            }
            Event::BookingCommitted {
                booking_id,
                slot_id,
                token,
                booked_at,
                details,
            } => {
                if rec.active_hold(*token).is_some() {
                    rec.end_hold(HoldState::Committed, MAX_HOLD_HISTORY);
                } else {
                    // Compacted logs carry bookings without their hold.
                    rec.state = SlotState::Booked;
                }
                rec.booking_id = Some(*booking_id);
                if let Some(client_ref) = &details.client_ref {
                    self.booking_refs.insert(client_ref.clone(), *booking_id);
                }
                self.bookings.insert(
                    *booking_id,
                    Booking {
                        id: *booking_id,
                        slot_id: *slot_id,
                        span: rec.span,
                        token: *token,
                        booked_at: *booked_at,
                        details: details.clone(),
                    },
                );
            }
            Event::HoldHistory { ended, .. } => {
                let skip = ended.len().saturating_sub(MAX_HOLD_HISTORY);
                rec.ended = ended[skip..]
                    .iter()
                    .map(|&(token, state)| EndedHold { token, state })
                    .collect();
            }
            Event::SlotsAdded { .. } | Event::SlotsRemoved { .. } => {}
        }
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    ///
    /// Holds the admin lock and a read lock on every slot for the duration,
    /// so no append can land between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _admin = self.admin.lock().await;

        let mut ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(slot) = self.slot(id) {
                guards.push(slot.read_owned().await);
            }
        }

        let mut events = vec![Event::SlotsAdded {
            slots: guards.iter().map(|g| (g.id, g.span)).collect(),
        }];
        for rec in &guards {
            if !rec.ended.is_empty() {
                events.push(Event::HoldHistory {
                    slot_id: rec.id,
                    ended: rec.ended.iter().map(|e| (e.token, e.state)).collect(),
                });
            }
            match (rec.state, rec.hold, rec.booking_id) {
                (SlotState::Held, Some(hold), _) => events.push(Event::HoldAcquired {
                    slot_id: rec.id,
                    token: hold.token,
                    issued_at: hold.issued_at,
                    expires_at: hold.expires_at,
                }),
                (SlotState::Booked, _, Some(booking_id)) => {
                    if let Some(b) = self.bookings.get(&booking_id) {
                        events.push(Event::BookingCommitted {
                            booking_id,
                            slot_id: rec.id,
                            token: b.token,
                            booked_at: b.booked_at,
                            details: b.details.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

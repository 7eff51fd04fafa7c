use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;
pub const WEEK_MS: Ms = 7 * DAY_MS;

/// Fixed slot granularity.
pub const SLOT_MS: Ms = 30 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// A single slot starting at `start`.
    pub fn slot_at(start: Ms) -> Self {
        Self::new(start, start + SLOT_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn shifted(&self, by: Ms) -> Self {
        Self::new(self.start + by, self.end + by)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Open,
    Held,
    Booked,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Open => "open",
            SlotState::Held => "held",
            SlotState::Booked => "booked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldState {
    Active,
    Expired,
    Released,
    Committed,
}

impl HoldState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldState::Active => "active",
            HoldState::Expired => "expired",
            HoldState::Released => "released",
            HoldState::Committed => "committed",
        }
    }
}

/// The single active lease on a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hold {
    pub token: Ulid,
    pub issued_at: Ms,
    pub expires_at: Ms,
}

impl Hold {
    pub fn is_lapsed(&self, now: Ms) -> bool {
        self.expires_at <= now
    }
}

/// A hold that reached a terminal state, kept so a late commit can be told
/// apart from a bogus token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndedHold {
    pub token: Ulid,
    pub state: HoldState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookingDetails {
    pub customer_name: String,
    pub customer_email: String,
    /// Payment provider reference (checkout session id). Commits are
    /// idempotent per reference.
    pub client_ref: Option<String>,
    /// Free-form JSON object.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub span: Span,
    pub token: Ulid,
    pub booked_at: Ms,
    pub details: BookingDetails,
}

/// Per-slot state guarded by the slot's lock.
#[derive(Debug, Clone)]
pub struct SlotRecord {
    pub id: Ulid,
    pub span: Span,
    pub state: SlotState,
    /// `Some` iff `state == Held`.
    pub hold: Option<Hold>,
    /// Most recent ended holds, oldest first.
    pub ended: Vec<EndedHold>,
    pub booking_id: Option<Ulid>,
}

impl SlotRecord {
    pub fn new(id: Ulid, span: Span) -> Self {
        Self {
            id,
            span,
            state: SlotState::Open,
            hold: None,
            ended: Vec::new(),
            booking_id: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SlotState::Open
    }

    /// Active hold matching `token`, if any.
    pub fn active_hold(&self, token: Ulid) -> Option<&Hold> {
        self.hold.as_ref().filter(|h| h.token == token)
    }

    /// Terminal state of a previously ended hold with this token.
    pub fn ended_state(&self, token: Ulid) -> Option<HoldState> {
        self.ended
            .iter()
            .rev()
            .find(|e| e.token == token)
            .map(|e| e.state)
    }

    /// Close the active hold and remember how it ended.
    pub fn end_hold(&mut self, state: HoldState, history_cap: usize) {
        if let Some(hold) = self.hold.take() {
            if self.ended.len() >= history_cap && !self.ended.is_empty() {
                self.ended.remove(0);
            }
            self.ended.push(EndedHold {
                token: hold.token,
                state,
            });
        }
        self.state = match state {
            HoldState::Committed => SlotState::Booked,
            _ => SlotState::Open,
        };
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotsAdded {
        slots: Vec<(Ulid, Span)>,
    },
    SlotsRemoved {
        ids: Vec<Ulid>,
    },
    HoldAcquired {
        slot_id: Ulid,
        token: Ulid,
        issued_at: Ms,
        expires_at: Ms,
    },
    HoldExtended {
        slot_id: Ulid,
        token: Ulid,
        expires_at: Ms,
    },
    /// Hold ended without a booking (`Expired` or `Released`).
    HoldEnded {
        slot_id: Ulid,
        token: Ulid,
        state: HoldState,
    },
    BookingCommitted {
        booking_id: Ulid,
        slot_id: Ulid,
        token: Ulid,
        booked_at: Ms,
        details: BookingDetails,
    },
    /// Ended holds of a slot, oldest first. Written by compaction only.
    HoldHistory {
        slot_id: Ulid,
        ended: Vec<(Ulid, HoldState)>,
    },
}

impl Event {
    /// Slot touched by a per-slot event; `None` for store-wide batches.
    pub fn slot_id(&self) -> Option<Ulid> {
        match self {
            Event::HoldAcquired { slot_id, .. }
            | Event::HoldExtended { slot_id, .. }
            | Event::HoldEnded { slot_id, .. }
            | Event::BookingCommitted { slot_id, .. }
            | Event::HoldHistory { slot_id, .. } => Some(*slot_id),
            Event::SlotsAdded { .. } | Event::SlotsRemoved { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub state: SlotState,
    pub hold_expires_at: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldGrant {
    pub slot_id: Ulid,
    pub token: Ulid,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInfo {
    pub slot_id: Ulid,
    pub token: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub issued_at: Ms,
    pub expires_at: Ms,
}

/// Result of an admin delete: removed Open slots and untouched Held/Booked ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteOutcome {
    pub deleted: usize,
    pub skipped: usize,
}

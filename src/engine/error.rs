use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    InvalidTimezone(String),
    InvalidTimestamp(String),
    InvalidRange(&'static str),
    InvalidRecurrence(&'static str),
    InvalidDetails(&'static str),
    SlotUnavailable(Ulid),
    SlotNotDeletable(Ulid),
    HoldNotFound(Ulid),
    HoldExpired(Ulid),
    LimitExceeded(&'static str),
    PaymentProvider(String),
    Storage(String),
}

impl EngineError {
    /// Lease races that callers are expected to absorb (heartbeat after
    /// expiry, checkout restart).
    pub fn is_lease_race(&self) -> bool {
        matches!(self, EngineError::HoldNotFound(_) | EngineError::HoldExpired(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTimezone(tz) => write!(f, "invalid timezone: {tz}"),
            EngineError::InvalidTimestamp(ts) => {
                write!(f, "invalid timestamp (expected YYYY-MM-DD HH:MM): {ts}")
            }
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::InvalidRecurrence(msg) => write!(f, "invalid recurrence: {msg}"),
            EngineError::InvalidDetails(msg) => write!(f, "invalid booking details: {msg}"),
            EngineError::SlotUnavailable(id) => write!(f, "slot unavailable: {id}"),
            EngineError::SlotNotDeletable(id) => {
                write!(f, "slot {id} is held or booked and cannot be deleted")
            }
            EngineError::HoldNotFound(id) => write!(f, "no active hold on slot {id} for this token"),
            EngineError::HoldExpired(id) => write!(f, "hold on slot {id} expired"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::PaymentProvider(e) => write!(f, "checkout session failed: {e}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

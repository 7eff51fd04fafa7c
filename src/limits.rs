use crate::model::{DAY_MS, Ms};

/// Upper bound on live slots in the store.
pub const MAX_SLOTS: usize = 100_000;

/// Repeats per generation request (a bit more than a year of dailies).
pub const MAX_OCCURRENCES: i64 = 400;

/// Widest base range a generation request may tile.
pub const MAX_BASE_RANGE_MS: Ms = 7 * DAY_MS;

/// Slots a single generation request may produce.
pub const MAX_GENERATED_SLOTS: usize = 20_000;

/// Ids in one `DELETE ... WHERE id IN (...)`.
pub const MAX_DELETE_IDS: usize = 10_000;

/// Ended holds remembered per slot.
pub const MAX_HOLD_HISTORY: usize = 8;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_CLIENT_REF_LEN: usize = 256;
pub const MAX_METADATA_LEN: usize = 8192;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

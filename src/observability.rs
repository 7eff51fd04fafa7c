use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotlease_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotlease_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotlease_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotlease_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotlease_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotlease_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotlease_wal_flush_batch_size";

/// Counter: WAL appends retried after an I/O failure.
pub const STORAGE_RETRIES_TOTAL: &str = "slotlease_storage_retries_total";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotlease_wal_compactions_total";

// ── Calendar ────────────────────────────────────────────────────

/// Gauge: live slots in the store.
pub const SLOTS_LIVE: &str = "slotlease_slots_live";

pub const SLOTS_GENERATED_TOTAL: &str = "slotlease_slots_generated_total";
pub const SLOTS_DELETED_TOTAL: &str = "slotlease_slots_deleted_total";

// ── Lease lifecycle ─────────────────────────────────────────────

pub const HOLDS_ACQUIRED_TOTAL: &str = "slotlease_holds_acquired_total";

/// Counter: acquire attempts that found the slot Held or Booked.
pub const HOLDS_CONTENDED_TOTAL: &str = "slotlease_holds_contended_total";

pub const HOLDS_EXTENDED_TOTAL: &str = "slotlease_holds_extended_total";
pub const HOLDS_RELEASED_TOTAL: &str = "slotlease_holds_released_total";
pub const HOLDS_EXPIRED_TOTAL: &str = "slotlease_holds_expired_total";

pub const BOOKINGS_COMMITTED_TOTAL: &str = "slotlease_bookings_committed_total";

/// Counter: commits refused for an expired or unknown hold.
pub const COMMITS_REJECTED_TOTAL: &str = "slotlease_commits_rejected_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertAvailability { .. } => "insert_availability",
        Command::DeleteSlots(_) => "delete_slots",
        Command::InsertHold { .. } => "insert_hold",
        Command::InsertHeartbeat { .. } => "insert_heartbeat",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertPayment { .. } => "insert_payment",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectHolds => "select_holds",
        Command::SelectBookings => "select_bookings",
    }
}

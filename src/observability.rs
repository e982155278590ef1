use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "glowbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "glowbook_query_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings confirmed.
pub const BOOKINGS_CREATED_TOTAL: &str = "glowbook_bookings_created_total";

/// Counter: reservation attempts refused. Labels: reason.
pub const BOOKING_REJECTIONS_TOTAL: &str = "glowbook_booking_rejections_total";

/// Counter: bookings moved to Cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "glowbook_bookings_cancelled_total";

/// Counter: bookings moved to Completed.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "glowbook_bookings_completed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "glowbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "glowbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "glowbook_connections_rejected_total";

/// Gauge: number of loaded tenants (salons).
pub const TENANTS_ACTIVE: &str = "glowbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "glowbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "glowbook_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertOffDay { .. } => "insert_off_day",
        Command::DeleteOffDay { .. } => "delete_off_day",
        Command::DeleteOffDays { .. } => "delete_off_days",
        Command::InsertBreak { .. } => "insert_break",
        Command::DeleteBreak { .. } => "delete_break",
        Command::InsertBooking(_) => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectSlotBoard { .. } => "select_slot_board",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectOffDays { .. } => "select_off_days",
        Command::SelectBreaks { .. } => "select_breaks",
        Command::SelectBookings(_) => "select_bookings",
    }
}

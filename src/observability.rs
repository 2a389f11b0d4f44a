use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command.
pub const QUERIES_TOTAL: &str = "aula_queries_total";

/// Counter: queries that returned an error. Labels: command.
pub const QUERY_ERRORS_TOTAL: &str = "aula_query_errors_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "aula_query_duration_seconds";

/// Counter: booking submissions accepted.
pub const BOOKINGS_SUBMITTED_TOTAL: &str = "aula_bookings_submitted_total";

/// Counter: booking status transitions applied. Labels: target.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "aula_booking_transitions_total";

/// Counter: exam seats allotted.
pub const SEATS_ALLOTTED_TOTAL: &str = "aula_seats_allotted_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "aula_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "aula_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "aula_connections_rejected_total";

/// Gauge: number of active campuses (loaded engines).
pub const CAMPUSES_ACTIVE: &str = "aula_campuses_active";

/// Gauge: halls registered across the process.
pub const HALLS_ACTIVE: &str = "aula_halls_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "aula_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "aula_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertHall { .. } => "insert_hall",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SetBookingStatus { .. } => "set_booking_status",
        Command::InsertExam { .. } => "insert_exam",
        Command::UpdateExam { .. } => "update_exam",
        Command::InsertAllotment { .. } => "insert_allotment",
        Command::UpdateAllotment { .. } => "update_allotment",
        Command::SelectHalls => "select_halls",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectExams => "select_exams",
        Command::SelectAllotments { .. } => "select_allotments",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
    }
}

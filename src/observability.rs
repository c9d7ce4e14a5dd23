use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotd_request_duration_seconds";

/// Counter: reservations committed.
pub const RESERVATIONS_TOTAL: &str = "slotd_reservations_total";

/// Counter: reservation attempts rejected on slot conflict.
pub const RESERVE_CONFLICTS_TOTAL: &str = "slotd_reserve_conflicts_total";

/// Counter: payment orders created.
pub const ORDERS_CREATED_TOTAL: &str = "slotd_orders_created_total";

/// Counter: bookings settled as paid.
pub const BOOKINGS_PAID_TOTAL: &str = "slotd_bookings_paid_total";

/// Counter: bookings marked failed by the gateway.
pub const BOOKINGS_FAILED_TOTAL: &str = "slotd_bookings_failed_total";

/// Counter: holds expired by the sweeper.
pub const BOOKINGS_EXPIRED_TOTAL: &str = "slotd_bookings_expired_total";

/// Counter: bookings cancelled by their owner.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotd_bookings_cancelled_total";

/// Counter: payment callbacks rejected on signature mismatch.
pub const SIGNATURE_FAILURES_TOTAL: &str = "slotd_signature_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Counter: handshake failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotd_auth_failures_total";

/// Gauge: holds currently pending payment or confirmation.
pub const HOLDS_ACTIVE: &str = "slotd_holds_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

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

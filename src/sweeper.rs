//! Background reconciliation: expires stale holds and compacts the WAL.
//!
//! Expiry is advisory everywhere else (reservation and availability already
//! treat an expired hold as free); the sweeper is what actually releases the
//! claims and moves the booking to Expired.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::localtime::now_ms;
use crate::model::{BookingState, Event};

impl Engine {
    /// Bookings whose hold deadline has passed, as of `now`.
    pub async fn collect_expired(&self, now: i64) -> Vec<Ulid> {
        let handles: Vec<(Ulid, crate::engine::SharedBooking)> = self
            .bookings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut expired = Vec::new();
        for (id, handle) in handles {
            let b = handle.read().await;
            if b.is_expired_hold(now) {
                expired.push(id);
            }
        }
        expired
    }

    /// One sweep pass: expire every stale hold and release its claims.
    /// Returns the number of bookings expired. Safe to run concurrently with
    /// settlement; a booking that was paid or failed between collection and
    /// expiry is skipped.
    pub async fn sweep(&self, now: i64) -> Result<usize, EngineError> {
        let mut expired = 0;
        for id in self.collect_expired(now).await {
            if self.expire_one(id, now).await? {
                expired += 1;
            }
        }
        if expired > 0 {
            metrics::counter!(crate::observability::BOOKINGS_EXPIRED_TOTAL)
                .increment(expired as u64);
        }
        Ok(expired)
    }

    async fn expire_one(&self, id: Ulid, now: i64) -> Result<bool, EngineError> {
        let (handle, resource_id, days) = match self.peek_days(&id).await {
            Ok(v) => v,
            Err(EngineError::BookingNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut guards = self.lock_days(resource_id, &days).await;
        let mut b = handle.write_owned().await;

        // Re-check under the lock: settlement may have won the race.
        if !b.is_expired_hold(now) {
            return Ok(false);
        }

        let event = Event::BookingExpired { booking_id: id };
        self.wal_append(&event).await?;
        b.state = BookingState::Expired;
        Self::release_claims(&mut guards, &b);
        self.note_hold_released(&b.user_id);
        self.notify.send(resource_id, &event);
        debug!("expired hold {id} on resource {resource_id}");
        Ok(true)
    }
}

/// Periodic sweep loop. One pass per tick; a pass that falls behind delays
/// the next tick rather than stacking.
pub async fn run_sweeper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.sweep(now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!("sweeper expired {n} stale holds"),
            Err(e) => error!("sweep pass failed: {e}"),
        }
    }
}

/// Periodic WAL compaction, triggered by append volume since the last
/// compaction rather than wall time alone.
pub async fn run_compactor(engine: Arc<Engine>, period: Duration, threshold: u64) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted wal after {appends} appends"),
            Err(e) => error!("wal compaction failed: {e}"),
        }
    }
}

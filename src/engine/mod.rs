mod availability;
mod error;
mod queries;
mod reserve;
mod settlement;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDay = Arc<RwLock<DayState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

/// Hold duration and related policy. All explicit configuration; nothing
/// here is inferred from the booking data.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a reservation stays held before the sweeper reclaims it.
    pub hold_ms: Ms,
    /// Cap on concurrently held (Pending/AwaitingPayment) bookings per user.
    /// `None` means unlimited.
    pub max_holds_per_user: Option<usize>,
    /// Shared secret for the gateway callback signing scheme.
    pub gateway_secret: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ms: 10 * 60 * 1000,
            max_holds_per_user: None,
            gateway_secret: "slotd".into(),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────────────

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

/// Background task that owns the WAL and batches appends for group commit:
/// buffer every immediately available append, then one flush_sync for the
/// whole batch, then respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }
                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// The booking core. Slot claims are partitioned per (resource, UTC day);
/// operations on disjoint resources or days never contend.
///
/// Lock order, everywhere: day locks (sorted by key) before a booking lock,
/// and a booking guard is never held while acquiring a day lock.
pub struct Engine {
    pub cfg: EngineConfig,
    pub(crate) resources: DashMap<Ulid, Resource>,
    pub(crate) days: DashMap<DayKey, SharedDay>,
    pub(crate) bookings: DashMap<Ulid, SharedBooking>,
    /// Gateway order ref → booking id.
    pub(crate) order_index: DashMap<String, Ulid>,
    /// Active (Pending/AwaitingPayment) bookings per user. Advisory: the
    /// per-user cap is checked against this without a user-level lock.
    pub(crate) user_holds: DashMap<String, usize>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, cfg: EngineConfig, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            cfg,
            resources: DashMap::new(),
            days: DashMap::new(),
            bookings: DashMap::new(),
            order_index: DashMap::new(),
            user_holds: DashMap::new(),
            wal_tx,
            notify,
        };

        // Replay. We are the sole owner of every Arc here, so try_write
        // always succeeds instantly. Never block_on inside this loop — it
        // may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    /// Apply one replayed event to in-memory state. Mirrors the mutations the
    /// live operations perform after their own WAL append.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::ResourceRegistered {
                id,
                name,
                tz_offset_minutes,
                hourly_rate_minor,
                currency,
            } => {
                self.resources.insert(
                    *id,
                    Resource {
                        id: *id,
                        name: name.clone(),
                        tz_offset_minutes: *tz_offset_minutes,
                        hourly_rate_minor: *hourly_rate_minor,
                        currency: currency.clone(),
                    },
                );
            }
            Event::BookingCreated {
                id,
                resource_id,
                user_id,
                slots,
                created_at,
                expires_at,
                price_minor,
                currency,
            } => {
                let booking = Booking {
                    id: *id,
                    resource_id: *resource_id,
                    user_id: user_id.clone(),
                    slots: slots.clone(),
                    state: BookingState::Pending,
                    created_at: *created_at,
                    expires_at: *expires_at,
                    price_minor: *price_minor,
                    currency: currency.clone(),
                    order: None,
                };
                for slot in slots {
                    let day = self.day_handle(*resource_id, slot.day);
                    day.try_write()
                        .expect("replay: uncontended write")
                        .claim(slot.hour, *id);
                }
                self.note_hold_taken(user_id);
                self.bookings.insert(*id, Arc::new(RwLock::new(booking)));
            }
            Event::OrderCreated {
                booking_id,
                order_id,
                gateway_ref,
                amount_minor,
                currency,
            } => {
                if let Some(entry) = self.bookings.get(booking_id) {
                    let mut b = entry.try_write().expect("replay: uncontended write");
                    b.state = BookingState::AwaitingPayment;
                    b.order = Some(PaymentOrder {
                        id: *order_id,
                        gateway_ref: gateway_ref.clone(),
                        amount_minor: *amount_minor,
                        currency: currency.clone(),
                        status: OrderStatus::Created,
                        payment_ref: None,
                    });
                    self.order_index.insert(gateway_ref.clone(), *booking_id);
                }
            }
            Event::BookingPaid {
                booking_id,
                payment_ref,
            } => {
                if let Some(entry) = self.bookings.get(booking_id) {
                    let mut b = entry.try_write().expect("replay: uncontended write");
                    b.state = BookingState::Paid;
                    if let Some(order) = b.order.as_mut() {
                        order.status = OrderStatus::Verified;
                        order.payment_ref = Some(payment_ref.clone());
                    }
                    let user = b.user_id.clone();
                    drop(b);
                    self.note_hold_released(&user);
                }
            }
            Event::BookingFailed { booking_id, .. } => {
                self.replay_release(booking_id, BookingState::Failed);
            }
            Event::BookingExpired { booking_id } => {
                self.replay_release(booking_id, BookingState::Expired);
            }
            Event::BookingCancelled { booking_id } => {
                self.replay_release(booking_id, BookingState::Cancelled);
            }
        }
    }

    /// Replay a slot-releasing terminal transition.
    fn replay_release(&self, booking_id: &Ulid, state: BookingState) {
        let Some(entry) = self.bookings.get(booking_id) else {
            return;
        };
        let arc = entry.value().clone();
        drop(entry);
        let mut b = arc.try_write().expect("replay: uncontended write");
        b.state = state;
        if state == BookingState::Failed
            && let Some(order) = b.order.as_mut()
        {
            order.status = OrderStatus::VerificationFailed;
        }
        for slot in &b.slots {
            if let Some(day) = self.days.get(&(b.resource_id, slot.day)) {
                day.try_write()
                    .expect("replay: uncontended write")
                    .release(slot.hour, b.id);
            }
        }
        let user = b.user_id.clone();
        drop(b);
        self.note_hold_released(&user);
    }

    /// Write an event through the background group-commit writer.
    pub(crate) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    // ── Locking helpers ──────────────────────────────────────────

    pub(crate) fn day_handle(&self, resource_id: Ulid, day: NaiveDate) -> SharedDay {
        self.days
            .entry((resource_id, day))
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(resource_id, day))))
            .clone()
    }

    /// Acquire write locks on the day states for `days`, in sorted key order.
    /// `days` must already be sorted and deduplicated.
    pub(crate) async fn lock_days(
        &self,
        resource_id: Ulid,
        days: &[NaiveDate],
    ) -> Vec<OwnedRwLockWriteGuard<DayState>> {
        let mut guards = Vec::with_capacity(days.len());
        for &day in days {
            let handle = self.day_handle(resource_id, day);
            guards.push(handle.write_owned().await);
        }
        guards
    }

    pub(crate) fn booking_handle(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Snapshot (resource_id, slot days) of a booking without holding its lock.
    /// Used to decide which day locks to take; the state is re-checked after
    /// locking, so a stale snapshot is harmless.
    pub(crate) async fn peek_days(
        &self,
        id: &Ulid,
    ) -> Result<(SharedBooking, Ulid, Vec<NaiveDate>), EngineError> {
        let handle = self
            .booking_handle(id)
            .ok_or(EngineError::BookingNotFound(*id))?;
        let (resource_id, days) = {
            let b = handle.read().await;
            (b.resource_id, b.slot_days())
        };
        Ok((handle, resource_id, days))
    }

    /// Drop the claims of a booking from the locked day states. Id-checked,
    /// so a claim overwritten by a later reservation is left alone.
    pub(crate) fn release_claims(
        guards: &mut [OwnedRwLockWriteGuard<DayState>],
        booking: &Booking,
    ) {
        for slot in &booking.slots {
            if let Some(g) = guards.iter_mut().find(|g| g.day == slot.day) {
                g.release(slot.hour, booking.id);
            }
        }
    }

    // ── Hold accounting ──────────────────────────────────────────

    pub(crate) fn note_hold_taken(&self, user_id: &str) {
        *self.user_holds.entry(user_id.to_string()).or_insert(0) += 1;
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).increment(1.0);
    }

    pub(crate) fn note_hold_released(&self, user_id: &str) {
        if let Some(mut n) = self.user_holds.get_mut(user_id) {
            *n = n.saturating_sub(1);
        }
        self.user_holds.remove_if(user_id, |_, n| *n == 0);
        metrics::gauge!(crate::observability::HOLDS_ACTIVE).decrement(1.0);
    }

    pub(crate) fn active_holds_of(&self, user_id: &str) -> usize {
        self.user_holds.get(user_id).map(|n| *n).unwrap_or(0)
    }

    // ── Compaction ───────────────────────────────────────────────

    /// Rewrite the WAL with the minimal event set recreating current state:
    /// resources, then non-terminal and Paid bookings with their settlement
    /// events. Terminal churn (Failed/Expired/Cancelled) is dropped.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.resources.iter() {
            let r = entry.value();
            events.push(Event::ResourceRegistered {
                id: r.id,
                name: r.name.clone(),
                tz_offset_minutes: r.tz_offset_minutes,
                hourly_rate_minor: r.hourly_rate_minor,
                currency: r.currency.clone(),
            });
        }

        // Clone the handles first: awaiting while holding a DashMap shard
        // guard could deadlock against a writer on the same shard.
        let handles: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for arc in handles {
            let b = arc.read().await;
            if b.state.is_terminal() && b.state != BookingState::Paid {
                continue;
            }
            events.push(Event::BookingCreated {
                id: b.id,
                resource_id: b.resource_id,
                user_id: b.user_id.clone(),
                slots: b.slots.clone(),
                created_at: b.created_at,
                expires_at: b.expires_at,
                price_minor: b.price_minor,
                currency: b.currency.clone(),
            });
            if let Some(order) = &b.order {
                events.push(Event::OrderCreated {
                    booking_id: b.id,
                    order_id: order.id,
                    gateway_ref: order.gateway_ref.clone(),
                    amount_minor: order.amount_minor,
                    currency: order.currency.clone(),
                });
                if b.state == BookingState::Paid {
                    events.push(Event::BookingPaid {
                        booking_id: b.id,
                        payment_ref: order.payment_ref.clone().unwrap_or_default(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
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

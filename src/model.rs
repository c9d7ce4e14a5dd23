use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only instant type.
pub type Ms = i64;

/// Mutual-exclusion scope for slot claims: one resource on one UTC day.
pub type DayKey = (Ulid, NaiveDate);

/// One hourly unit of bookable time, stored in UTC.
/// The local-facing label is derived via `localtime`, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub day: NaiveDate,
    pub hour: u8,
}

impl SlotKey {
    pub fn new(day: NaiveDate, hour: u8) -> Self {
        debug_assert!(hour < 24, "SlotKey hour out of range");
        Self { day, hour }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingState {
    Pending,
    AwaitingPayment,
    Paid,
    Failed,
    Expired,
    Cancelled,
}

impl BookingState {
    /// Terminal states are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingState::Paid
                | BookingState::Failed
                | BookingState::Expired
                | BookingState::Cancelled
        )
    }

    /// States whose slots block other claims.
    pub fn claims_slots(&self) -> bool {
        matches!(
            self,
            BookingState::Pending | BookingState::AwaitingPayment | BookingState::Paid
        )
    }

    /// A hold: claimed but not yet settled. Subject to expiry.
    pub fn is_held(&self) -> bool {
        matches!(self, BookingState::Pending | BookingState::AwaitingPayment)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingState::Pending => "pending",
            BookingState::AwaitingPayment => "awaiting_payment",
            BookingState::Paid => "paid",
            BookingState::Failed => "failed",
            BookingState::Expired => "expired",
            BookingState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Verified,
    VerificationFailed,
}

/// Payment order owned by exactly one booking. Created at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub id: Ulid,
    pub gateway_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: OrderStatus,
    /// Set when the gateway callback verifies.
    pub payment_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: String,
    /// Sorted, distinct, all on one local calendar date. Immutable after creation.
    pub slots: Vec<SlotKey>,
    pub state: BookingState,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub price_minor: i64,
    pub currency: String,
    pub order: Option<PaymentOrder>,
}

impl Booking {
    /// Distinct UTC days this booking's slots touch (one or two), sorted.
    pub fn slot_days(&self) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = self.slots.iter().map(|s| s.day).collect();
        days.sort();
        days.dedup();
        days
    }

    /// A hold that has outlived its expiry and may be reclaimed.
    pub fn is_expired_hold(&self, now: Ms) -> bool {
        self.state.is_held() && self.expires_at <= now
    }
}

/// Bookable resource. Registered once, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Local-time offset from UTC. The only timezone state in the system.
    pub tz_offset_minutes: i32,
    pub hourly_rate_minor: i64,
    pub currency: String,
}

/// Claims table for one (resource, UTC day). Guarded by the day lock:
/// every claim mutation for this scope goes through this lock.
#[derive(Debug)]
pub struct DayState {
    pub resource_id: Ulid,
    pub day: NaiveDate,
    /// UTC hour → claiming booking id. Entries may go stale when a hold
    /// expires before the sweeper runs; release is id-checked for that reason.
    claims: HashMap<u8, Ulid>,
}

impl DayState {
    pub fn new(resource_id: Ulid, day: NaiveDate) -> Self {
        Self {
            resource_id,
            day,
            claims: HashMap::new(),
        }
    }

    pub fn claimant(&self, hour: u8) -> Option<Ulid> {
        self.claims.get(&hour).copied()
    }

    pub fn claim(&mut self, hour: u8, booking_id: Ulid) {
        self.claims.insert(hour, booking_id);
    }

    /// Remove a claim only if `booking_id` still owns it.
    pub fn release(&mut self, hour: u8, booking_id: Ulid) {
        if self.claims.get(&hour) == Some(&booking_id) {
            self.claims.remove(&hour);
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: String,
        tz_offset_minutes: i32,
        hourly_rate_minor: i64,
        currency: String,
    },
    BookingCreated {
        id: Ulid,
        resource_id: Ulid,
        user_id: String,
        slots: Vec<SlotKey>,
        created_at: Ms,
        expires_at: Ms,
        price_minor: i64,
        currency: String,
    },
    OrderCreated {
        booking_id: Ulid,
        order_id: Ulid,
        gateway_ref: String,
        amount_minor: i64,
        currency: String,
    },
    BookingPaid {
        booking_id: Ulid,
        payment_ref: String,
    },
    BookingFailed {
        booking_id: Ulid,
        reason: String,
    },
    BookingExpired {
        booking_id: Ulid,
    },
    BookingCancelled {
        booking_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    Held,
    Booked,
    Past,
}

/// One entry of the 24-slot availability grid for a local date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    /// Index into the local day grid (0..24).
    pub index: u8,
    pub slot: SlotKey,
    /// Local start label, e.g. "09:00" (or "09:30" for half-hour offsets).
    pub local_start: String,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingView {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub user_id: String,
    pub state: BookingState,
    pub slots: Vec<SlotKey>,
    pub created_at: Ms,
    pub expires_at: Ms,
    pub price_minor: i64,
    pub currency: String,
    pub order_ref: Option<String>,
    pub payment_ref: Option<String>,
}

impl From<&Booking> for BookingView {
    fn from(b: &Booking) -> Self {
        Self {
            id: b.id,
            resource_id: b.resource_id,
            user_id: b.user_id.clone(),
            state: b.state,
            slots: b.slots.clone(),
            created_at: b.created_at,
            expires_at: b.expires_at,
            price_minor: b.price_minor,
            currency: b.currency.clone(),
            order_ref: b.order.as_ref().map(|o| o.gateway_ref.clone()),
            payment_ref: b.order.as_ref().and_then(|o| o.payment_ref.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: Ulid,
    pub booking_id: Ulid,
    pub gateway_ref: String,
    pub amount_minor: i64,
    pub currency: String,
    pub status: OrderStatus,
}

/// Per-resource count of currently-held (Pending/AwaitingPayment) bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldCount {
    pub resource_id: Ulid,
    pub held: usize,
}

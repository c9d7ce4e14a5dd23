use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::localtime::{self, now_ms};
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Seed a bookable resource. Not an admin surface: resources are
    /// immutable once registered.
    pub async fn register_resource(
        &self,
        id: Ulid,
        name: String,
        tz_offset_minutes: i32,
        hourly_rate_minor: i64,
        currency: String,
    ) -> Result<Resource, EngineError> {
        if self.resources.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name length"));
        }
        if tz_offset_minutes.abs() > MAX_TZ_OFFSET_MINUTES {
            return Err(EngineError::LimitExceeded("timezone offset out of range"));
        }
        if !(0..=MAX_HOURLY_RATE_MINOR).contains(&hourly_rate_minor) {
            return Err(EngineError::LimitExceeded("hourly rate out of range"));
        }
        if self.resources.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::ResourceRegistered {
            id,
            name: name.clone(),
            tz_offset_minutes,
            hourly_rate_minor,
            currency: currency.clone(),
        };
        self.wal_append(&event).await?;
        let resource = Resource {
            id,
            name,
            tz_offset_minutes,
            hourly_rate_minor,
            currency,
        };
        self.resources.insert(id, resource.clone());
        self.notify.send(id, &event);
        Ok(resource)
    }

    /// Atomically claim a slot set for `user_id` on the local date's grid.
    ///
    /// `grid_indices` index the 24-slot local day grid (see
    /// `localtime::day_slots`). All-or-nothing: any conflicting slot fails
    /// the whole request with the full set of conflicts, and nothing is
    /// created. First committer wins; losers are reported, never queued.
    pub async fn reserve(
        &self,
        resource_id: Ulid,
        local_date: NaiveDate,
        grid_indices: &[u8],
        user_id: &str,
    ) -> Result<BookingView, EngineError> {
        let resource = self
            .resources
            .get(&resource_id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::LimitExceeded("user id length"));
        }
        if local_date.year() < MIN_BOOKABLE_YEAR || local_date.year() > MAX_BOOKABLE_YEAR {
            return Err(EngineError::LimitExceeded("date out of bookable range"));
        }
        if grid_indices.is_empty() {
            return Err(EngineError::InvalidSlotSet("empty slot set"));
        }
        if grid_indices.len() > MAX_SLOTS_PER_BOOKING {
            return Err(EngineError::InvalidSlotSet("too many slots"));
        }
        if grid_indices.iter().any(|&i| i >= 24) {
            return Err(EngineError::InvalidSlotSet("grid index out of range"));
        }
        let mut indices = grid_indices.to_vec();
        indices.sort_unstable();
        indices.dedup();
        if indices.len() != grid_indices.len() {
            return Err(EngineError::InvalidSlotSet("duplicate slots"));
        }

        let grid = localtime::day_slots(local_date, resource.tz_offset_minutes);
        let slots: Vec<SlotKey> = indices.iter().map(|&i| grid[i as usize]).collect();

        let now = now_ms();
        for slot in &slots {
            if localtime::slot_start_ms(slot) <= now {
                return Err(EngineError::PastSlot(*slot));
            }
        }

        // Advisory cap; checked without a user-level lock, so two racing
        // reservations by the same user may both pass at the boundary.
        if let Some(limit) = self.cfg.max_holds_per_user
            && self.active_holds_of(user_id) >= limit
        {
            return Err(EngineError::HoldLimit {
                user_id: user_id.to_string(),
                limit,
            });
        }

        let mut days: Vec<NaiveDate> = slots.iter().map(|s| s.day).collect();
        days.sort();
        days.dedup();
        let mut guards = self.lock_days(resource_id, &days).await;

        // Re-check every requested slot inside the locked scope. A claim by
        // an expired-but-unswept hold does not block; the stale claim is
        // overwritten below and reconciled by id-checked release.
        let mut conflicts = Vec::new();
        for slot in &slots {
            let guard = guards
                .iter()
                .find(|g| g.day == slot.day)
                .expect("slot day is locked");
            let Some(claimant_id) = guard.claimant(slot.hour) else {
                continue;
            };
            if let Some(claimant) = self.booking_handle(&claimant_id) {
                let c = claimant.read().await;
                if c.state.claims_slots() && !c.is_expired_hold(now) {
                    conflicts.push(*slot);
                }
            }
        }
        if !conflicts.is_empty() {
            metrics::counter!(crate::observability::RESERVE_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::SlotConflict(conflicts));
        }

        let id = Ulid::new();
        let created_at = now;
        let expires_at = now + self.cfg.hold_ms;
        let price_minor = resource.hourly_rate_minor * slots.len() as i64;
        let event = Event::BookingCreated {
            id,
            resource_id,
            user_id: user_id.to_string(),
            slots: slots.clone(),
            created_at,
            expires_at,
            price_minor,
            currency: resource.currency.clone(),
        };
        self.wal_append(&event).await?;

        for slot in &slots {
            let guard = guards
                .iter_mut()
                .find(|g| g.day == slot.day)
                .expect("slot day is locked");
            guard.claim(slot.hour, id);
        }
        let booking = Booking {
            id,
            resource_id,
            user_id: user_id.to_string(),
            slots,
            state: BookingState::Pending,
            created_at,
            expires_at,
            price_minor,
            currency: resource.currency,
            order: None,
        };
        let view = BookingView::from(&booking);
        self.bookings
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(booking)));
        self.note_hold_taken(user_id);
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL).increment(1);
        self.notify.send(resource_id, &event);
        Ok(view)
    }

    /// Owner-initiated cancellation of a Pending booking. Releases the slots
    /// immediately. A no-op when the booking is already terminal; rejected
    /// while a payment order is outstanding.
    pub async fn cancel(&self, booking_id: Ulid, user_id: &str) -> Result<BookingView, EngineError> {
        let (handle, resource_id, days) = self.peek_days(&booking_id).await?;
        let mut guards = self.lock_days(resource_id, &days).await;
        let mut b = handle.write_owned().await;

        if b.user_id != user_id {
            return Err(EngineError::NotOwner(booking_id));
        }
        if b.state.is_terminal() {
            return Ok(BookingView::from(&*b));
        }
        if b.state == BookingState::AwaitingPayment {
            return Err(EngineError::NotPending {
                id: booking_id,
                state: b.state,
            });
        }

        let event = Event::BookingCancelled { booking_id };
        self.wal_append(&event).await?;
        b.state = BookingState::Cancelled;
        Self::release_claims(&mut guards, &b);
        self.note_hold_released(&b.user_id);
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        self.notify.send(resource_id, &event);
        Ok(BookingView::from(&*b))
    }
}

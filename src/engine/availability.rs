use chrono::NaiveDate;
use ulid::Ulid;

use crate::localtime::{self, now_ms};
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The 24-slot grid for a resource's local date. Each entry reports the
    /// slot's UTC key, its local start, and its status as of now.
    ///
    /// Holds past their expiry read as Available even before the sweeper has
    /// reclaimed them, so the view never blocks on background reconciliation.
    pub async fn availability(
        &self,
        resource_id: Ulid,
        local_date: NaiveDate,
    ) -> Result<Vec<SlotView>, EngineError> {
        let resource = self
            .resources
            .get(&resource_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        let slots = localtime::day_slots(local_date, resource.tz_offset_minutes);
        let now = now_ms();
        let mut views = Vec::with_capacity(slots.len());

        // Slot days are consecutive, so at most two read locks are taken and
        // each is held only while its slots are scanned.
        let mut current: Option<(NaiveDate, tokio::sync::OwnedRwLockReadGuard<DayState>)> = None;
        for (index, slot) in slots.into_iter().enumerate() {
            if current.as_ref().map(|(d, _)| *d) != Some(slot.day) {
                let guard = self.day_handle(resource_id, slot.day).read_owned().await;
                current = Some((slot.day, guard));
            }
            let (_, day) = current.as_ref().expect("day guard just set");

            let mut status = if let Some(claimant) = day.claimant(slot.hour) {
                self.slot_status_of(claimant, now).await
            } else {
                None
            };
            if status.is_none() {
                status = Some(if localtime::slot_start_ms(&slot) <= now {
                    SlotStatus::Past
                } else {
                    SlotStatus::Available
                });
            }

            views.push(SlotView {
                index: index as u8,
                slot,
                local_start: localtime::local_label(&slot, resource.tz_offset_minutes),
                status: status.expect("status resolved"),
            });
        }
        Ok(views)
    }

    /// Resolve a claimant booking to Held or Booked, or None when the claim
    /// is stale (expired hold, or a booking that no longer claims slots).
    async fn slot_status_of(&self, claimant: Ulid, now: Ms) -> Option<SlotStatus> {
        let handle = self.booking_handle(&claimant)?;
        let b = handle.read().await;
        if b.state == BookingState::Paid {
            return Some(SlotStatus::Booked);
        }
        if b.state.is_held() && !b.is_expired_hold(now) {
            return Some(SlotStatus::Held);
        }
        None
    }
}

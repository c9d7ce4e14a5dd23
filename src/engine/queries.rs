use std::collections::HashMap;

use ulid::Ulid;

use crate::localtime::now_ms;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<BookingView, EngineError> {
        let handle = self
            .booking_handle(&id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let b = handle.read().await;
        Ok(BookingView::from(&*b))
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        let mut out: Vec<Resource> = self.resources.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Live hold counts per resource. Expired-but-unswept holds are excluded,
    /// so the number matches what a reservation attempt would actually see.
    pub async fn held_counts(&self) -> Vec<HeldCount> {
        let now = now_ms();
        let handles: Vec<super::SharedBooking> =
            self.bookings.iter().map(|e| e.value().clone()).collect();

        let mut counts: HashMap<Ulid, usize> = HashMap::new();
        for handle in handles {
            let b = handle.read().await;
            if b.state.is_held() && !b.is_expired_hold(now) {
                *counts.entry(b.resource_id).or_default() += 1;
            }
        }

        let mut out: Vec<HeldCount> = counts
            .into_iter()
            .map(|(resource_id, held)| HeldCount { resource_id, held })
            .collect();
        out.sort_by_key(|h| h.resource_id);
        out
    }
}

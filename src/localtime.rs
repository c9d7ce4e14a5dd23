//! UTC ↔ local-time conversion for the slot grid.
//!
//! Slots are stored as UTC (day, hour) pairs; viewers see local labels.
//! Everything here is pure. Both the availability index and the wire layer
//! use these functions, so day-boundary rounding cannot diverge.
//!
//! A slot belongs to the grid of local date D exactly when its *local*
//! start date is D. Every local day contains exactly 24 on-the-hour UTC
//! instants, so the grid of any local date is 24 consecutive UTC slots and
//! the grids of adjacent dates partition the UTC hour line.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

use crate::model::{Ms, SlotKey};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// UTC start instant of a slot.
pub fn slot_start_utc(slot: &SlotKey) -> NaiveDateTime {
    slot.day
        .and_hms_opt(slot.hour as u32, 0, 0)
        .expect("slot hour < 24")
}

/// UTC start instant in unix milliseconds.
pub fn slot_start_ms(slot: &SlotKey) -> Ms {
    slot_start_utc(slot).and_utc().timestamp_millis()
}

/// Local start instant of a slot for a resource at the given offset.
pub fn local_start(slot: &SlotKey, offset_minutes: i32) -> NaiveDateTime {
    slot_start_utc(slot) + Duration::minutes(offset_minutes as i64)
}

/// The local calendar date a slot belongs to.
pub fn local_date_of(slot: &SlotKey, offset_minutes: i32) -> NaiveDate {
    local_start(slot, offset_minutes).date()
}

/// Local "HH:MM" label of a slot start. Half-hour offsets produce ":30" labels.
pub fn local_label(slot: &SlotKey, offset_minutes: i32) -> String {
    local_start(slot, offset_minutes).format("%H:%M").to_string()
}

/// The 24 UTC slots forming the grid of `local_date` at the given offset,
/// in local order. Index i of the result is grid position i (the i-th
/// hour of the local day).
pub fn day_slots(local_date: NaiveDate, offset_minutes: i32) -> Vec<SlotKey> {
    let local_midnight = local_date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is valid");
    let utc_midnight = local_midnight - Duration::minutes(offset_minutes as i64);
    let first = ceil_to_hour(utc_midnight);

    (0..24)
        .map(|i| {
            let t = first + Duration::hours(i);
            SlotKey::new(t.date(), t.hour() as u8)
        })
        .collect()
}

/// First on-the-hour UTC instant at or after `t`.
fn ceil_to_hour(t: NaiveDateTime) -> NaiveDateTime {
    let floored = t
        .date()
        .and_hms_opt(t.hour(), 0, 0)
        .expect("on-the-hour time is valid");
    if floored == t {
        floored
    } else {
        floored + Duration::hours(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFSETS: &[i32] = &[0, 60, -60, 330, -570, 345, 765, -720, 840];

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn zero_offset_grid_is_the_utc_day() {
        let grid = day_slots(d("2099-06-01"), 0);
        assert_eq!(grid.len(), 24);
        for (i, slot) in grid.iter().enumerate() {
            assert_eq!(slot.day, d("2099-06-01"));
            assert_eq!(slot.hour as usize, i);
            assert_eq!(local_label(slot, 0), format!("{i:02}:00"));
        }
    }

    #[test]
    fn india_offset_shifts_grid_back() {
        // +05:30 — the first local slot of D starts at D-1 19:00 UTC (00:30 local).
        let grid = day_slots(d("2099-06-01"), 330);
        assert_eq!(grid[0], SlotKey::new(d("2099-05-31"), 19));
        assert_eq!(local_label(&grid[0], 330), "00:30");
        assert_eq!(grid[23], SlotKey::new(d("2099-06-01"), 18));
        assert_eq!(local_label(&grid[23], 330), "23:30");
    }

    #[test]
    fn every_grid_slot_maps_back_to_its_date() {
        for &off in OFFSETS {
            for date in [d("2099-06-01"), d("2099-12-31"), d("2100-01-01")] {
                for slot in day_slots(date, off) {
                    assert_eq!(
                        local_date_of(&slot, off),
                        date,
                        "offset {off}, slot {slot:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn adjacent_grids_partition_the_hour_line() {
        // No slot duplicated, no slot lost across local midnight.
        for &off in OFFSETS {
            let a = day_slots(d("2099-06-01"), off);
            let b = day_slots(d("2099-06-02"), off);
            for s in &a {
                assert!(!b.contains(s), "offset {off}: slot {s:?} in both grids");
            }
            // Contiguous: the day after A's last slot hour is B's first.
            let expected_next = slot_start_utc(&a[23]) + Duration::hours(1);
            assert_eq!(slot_start_utc(&b[0]), expected_next, "offset {off}");
        }
    }

    #[test]
    fn grid_is_24_consecutive_utc_hours() {
        for &off in OFFSETS {
            let grid = day_slots(d("2099-06-01"), off);
            assert_eq!(grid.len(), 24);
            for w in grid.windows(2) {
                assert_eq!(
                    slot_start_utc(&w[1]) - slot_start_utc(&w[0]),
                    Duration::hours(1),
                    "offset {off}"
                );
            }
        }
    }

    #[test]
    fn late_evening_slot_does_not_straddle_dates() {
        // A slot whose local start is 23:30 belongs wholly to that local date,
        // even though it *ends* on the next one.
        let slot = SlotKey::new(d("2099-06-01"), 18); // 23:30 local at +05:30
        assert_eq!(local_date_of(&slot, 330), d("2099-06-01"));
        let grid_today = day_slots(d("2099-06-01"), 330);
        let grid_tomorrow = day_slots(d("2099-06-02"), 330);
        assert!(grid_today.contains(&slot));
        assert!(!grid_tomorrow.contains(&slot));
    }

    #[test]
    fn slot_start_ms_is_utc() {
        let slot = SlotKey::new(d("2099-06-01"), 9);
        let ms = slot_start_ms(&slot);
        // Independent of any offset.
        assert_eq!(
            ms,
            slot_start_utc(&slot).and_utc().timestamp_millis()
        );
        // One hour later for the next slot.
        let next = SlotKey::new(d("2099-06-01"), 10);
        assert_eq!(slot_start_ms(&next) - ms, 3_600_000);
    }
}

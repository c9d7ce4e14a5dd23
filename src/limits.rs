//! Hard limits protecting the engine from unbounded input.

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 128;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_REF_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 512;

/// A booking claims whole hours of a single local day.
pub const MAX_SLOTS_PER_BOOKING: usize = 24;

/// Timezone offsets beyond ±18h do not exist.
pub const MAX_TZ_OFFSET_MINUTES: i32 = 18 * 60;

/// Hourly rate ceiling in minor units. Keeps a full-day booking's price
/// (and the amount forwarded to the gateway) far from i64 overflow.
pub const MAX_HOURLY_RATE_MINOR: i64 = 1_000_000_000_000;

/// Reservable date window, inclusive years.
pub const MIN_BOOKABLE_YEAR: i32 = 2000;
pub const MAX_BOOKABLE_YEAR: i32 = 2200;

/// Longest accepted wire frame.
pub const MAX_WIRE_LINE: usize = 64 * 1024;

/// Gateway order creation: attempts and initial backoff (doubled each retry).
pub const GATEWAY_ATTEMPTS: u32 = 3;
pub const GATEWAY_BACKOFF_MS: u64 = 200;

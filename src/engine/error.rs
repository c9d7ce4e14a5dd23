use ulid::Ulid;

use crate::gateway::GatewayError;
use crate::model::{BookingState, SlotKey};

#[derive(Debug)]
pub enum EngineError {
    ResourceNotFound(Ulid),
    BookingNotFound(Ulid),
    OrderNotFound(String),
    /// Slot race lost. Names every requested slot that is already claimed.
    SlotConflict(Vec<SlotKey>),
    InvalidSlotSet(&'static str),
    PastSlot(SlotKey),
    NotOwner(Ulid),
    NotPending { id: Ulid, state: BookingState },
    BookingExpired(Ulid),
    AlreadyFinalized { id: Ulid, state: BookingState },
    SignatureInvalid { order_ref: String },
    HoldLimit { user_id: String, limit: usize },
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    Gateway(GatewayError),
    WalError(String),
}

impl EngineError {
    /// Classification used by the wire layer and metrics. Conflict, validation
    /// and expiry are expected outcomes; authenticity and storage are incidents.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SlotConflict(_) => "conflict",
            EngineError::InvalidSlotSet(_)
            | EngineError::PastSlot(_)
            | EngineError::NotOwner(_)
            | EngineError::NotPending { .. }
            | EngineError::AlreadyFinalized { .. }
            | EngineError::HoldLimit { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::LimitExceeded(_) => "validation",
            EngineError::BookingExpired(_) => "expiry",
            EngineError::ResourceNotFound(_)
            | EngineError::BookingNotFound(_)
            | EngineError::OrderNotFound(_) => "not_found",
            EngineError::SignatureInvalid { .. } => "authenticity",
            EngineError::Gateway(_) => "gateway",
            EngineError::WalError(_) => "storage",
        }
    }

    /// Incidents get logged at error level; everything else is an expected
    /// outcome returned to the caller.
    pub fn is_incident(&self) -> bool {
        matches!(
            self,
            EngineError::SignatureInvalid { .. } | EngineError::WalError(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::OrderNotFound(r) => write!(f, "order not found: {r}"),
            EngineError::SlotConflict(slots) => {
                let hours: Vec<String> = slots
                    .iter()
                    .map(|s| format!("{} {:02}:00Z", s.day, s.hour))
                    .collect();
                write!(f, "slot conflict: {}", hours.join(", "))
            }
            EngineError::InvalidSlotSet(msg) => write!(f, "invalid slot set: {msg}"),
            EngineError::PastSlot(s) => {
                write!(f, "slot already started: {} {:02}:00Z", s.day, s.hour)
            }
            EngineError::NotOwner(id) => write!(f, "booking {id} belongs to another user"),
            EngineError::NotPending { id, state } => {
                write!(f, "booking {id} is {}, not pending", state.as_str())
            }
            EngineError::BookingExpired(id) => write!(f, "booking {id} hold has expired"),
            EngineError::AlreadyFinalized { id, state } => {
                write!(f, "booking {id} already finalized as {}", state.as_str())
            }
            EngineError::SignatureInvalid { order_ref } => {
                write!(f, "invalid payment signature for order {order_ref}")
            }
            EngineError::HoldLimit { user_id, limit } => {
                write!(f, "user {user_id} already holds {limit} pending bookings")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Gateway(e) => write!(f, "payment gateway: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        EngineError::Gateway(e)
    }
}

//! Payment gateway contract. Only the interface is modeled here; a real
//! HTTP client implements `PaymentGateway` outside this core.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;
use ulid::Ulid;

use crate::limits::{GATEWAY_ATTEMPTS, GATEWAY_BACKOFF_MS};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network/timeout failure. Retried a bounded number of times.
    Transient(String),
    /// The gateway refused the order. Never retried.
    Rejected(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Transient(e) => write!(f, "transient gateway failure: {e}"),
            GatewayError::Rejected(e) => write!(f, "gateway rejected order: {e}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Result of `order.create` at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedOrder {
    pub gateway_ref: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        booking_ref: &str,
    ) -> Result<CreatedOrder, GatewayError>;
}

/// Create an order with bounded retries on transient failure only.
/// Verification failures are never retried; that policy lives in the caller.
pub async fn create_order_with_retry(
    gateway: &dyn PaymentGateway,
    amount_minor: i64,
    currency: &str,
    booking_ref: &str,
) -> Result<CreatedOrder, GatewayError> {
    let mut delay = Duration::from_millis(GATEWAY_BACKOFF_MS);
    let mut attempt = 1u32;
    loop {
        match gateway.create_order(amount_minor, currency, booking_ref).await {
            Ok(order) => return Ok(order),
            Err(GatewayError::Transient(e)) if attempt < GATEWAY_ATTEMPTS => {
                warn!("gateway order.create attempt {attempt} failed: {e}, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Callback signing ─────────────────────────────────────────────

/// Compute the callback signature: hex HMAC-SHA256 over
/// `order_ref|payment_ref` with the shared secret.
pub fn sign(secret: &str, order_ref: &str, payment_ref: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(order_ref.as_bytes());
    mac.update(b"|");
    mac.update(payment_ref.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// Constant-time verification of a callback signature.
pub fn verify_signature(secret: &str, order_ref: &str, payment_ref: &str, signature: &str) -> bool {
    let Some(sig) = hex_decode(signature) else {
        return false;
    };
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(order_ref.as_bytes());
    mac.update(b"|");
    mac.update(payment_ref.as_bytes());
    // verify_slice is constant-time.
    mac.verify_slice(&sig).is_ok()
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

// ── Development gateway ──────────────────────────────────────────

/// Mints order refs locally; every order is accepted. Used when no real
/// gateway is configured and throughout the test suite.
pub struct LocalGateway;

#[async_trait]
impl PaymentGateway for LocalGateway {
    async fn create_order(
        &self,
        _amount_minor: i64,
        _currency: &str,
        _booking_ref: &str,
    ) -> Result<CreatedOrder, GatewayError> {
        Ok(CreatedOrder {
            gateway_ref: format!("order_{}", Ulid::new()),
        })
    }
}

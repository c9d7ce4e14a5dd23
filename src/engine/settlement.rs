use tracing::warn;
use ulid::Ulid;

use crate::gateway::{self, PaymentGateway};
use crate::limits::*;
use crate::localtime::now_ms;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Create the payment order for a Pending booking, moving it to
    /// AwaitingPayment. Idempotent: an AwaitingPayment booking returns its
    /// existing order instead of minting a second one.
    ///
    /// The gateway call happens outside every lock; the transition is
    /// re-checked afterwards, so a racing expiry or duplicate request can
    /// never produce two orders for one booking.
    pub async fn create_order(
        &self,
        booking_id: Ulid,
        gateway: &dyn PaymentGateway,
    ) -> Result<OrderView, EngineError> {
        let handle = self
            .booking_handle(&booking_id)
            .ok_or(EngineError::BookingNotFound(booking_id))?;
        let now = now_ms();

        let (amount_minor, currency) = {
            let b = handle.read().await;
            match b.state {
                BookingState::Pending if b.expires_at <= now => {
                    return Err(EngineError::BookingExpired(booking_id));
                }
                BookingState::Pending => (b.price_minor, b.currency.clone()),
                BookingState::AwaitingPayment => {
                    let order = b.order.as_ref().expect("awaiting payment implies order");
                    return Ok(order_view(&b, order));
                }
                BookingState::Expired => return Err(EngineError::BookingExpired(booking_id)),
                state => {
                    return Err(EngineError::NotPending {
                        id: booking_id,
                        state,
                    });
                }
            }
        };

        let created = gateway::create_order_with_retry(
            gateway,
            amount_minor,
            &currency,
            &booking_id.to_string(),
        )
        .await?;

        let mut b = handle.write_owned().await;
        match b.state {
            BookingState::Pending if b.expires_at <= now_ms() => {
                warn!(
                    "booking {booking_id} expired during order creation, \
                     gateway order {} is orphaned",
                    created.gateway_ref
                );
                Err(EngineError::BookingExpired(booking_id))
            }
            BookingState::Pending => {
                let order_id = Ulid::new();
                let event = Event::OrderCreated {
                    booking_id,
                    order_id,
                    gateway_ref: created.gateway_ref.clone(),
                    amount_minor,
                    currency: currency.clone(),
                };
                self.wal_append(&event).await?;
                b.state = BookingState::AwaitingPayment;
                b.order = Some(PaymentOrder {
                    id: order_id,
                    gateway_ref: created.gateway_ref.clone(),
                    amount_minor,
                    currency,
                    status: OrderStatus::Created,
                    payment_ref: None,
                });
                self.order_index.insert(created.gateway_ref, booking_id);
                metrics::counter!(crate::observability::ORDERS_CREATED_TOTAL).increment(1);
                self.notify.send(b.resource_id, &event);
                let order = b.order.as_ref().expect("order just set");
                Ok(order_view(&b, order))
            }
            BookingState::AwaitingPayment => {
                // Raced with another create_order call that won.
                warn!(
                    "duplicate order creation for booking {booking_id}, \
                     gateway order {} is orphaned",
                    created.gateway_ref
                );
                let order = b.order.as_ref().expect("awaiting payment implies order");
                Ok(order_view(&b, order))
            }
            BookingState::Expired => Err(EngineError::BookingExpired(booking_id)),
            state => Err(EngineError::NotPending {
                id: booking_id,
                state,
            }),
        }
    }

    /// Settle a gateway callback. Authenticity is checked before anything
    /// else — even the order lookup — so an unauthenticated caller cannot
    /// distinguish live order refs from dead ones. A valid proof moves
    /// AwaitingPayment → Paid exactly once, and a duplicate callback for a
    /// Paid booking succeeds idempotently.
    ///
    /// A forged signature never transitions the booking: the hold stays
    /// AwaitingPayment for operator review rather than masking a real payment.
    ///
    /// A late callback for a lapsed hold still settles, but only while the
    /// booking holds every one of its slot claims. If another reservation has
    /// overwritten a stale claim, settling would put two non-terminal
    /// bookings on one slot; the booking is expired on the spot instead.
    pub async fn verify(
        &self,
        order_ref: &str,
        payment_ref: &str,
        signature: &str,
    ) -> Result<BookingView, EngineError> {
        if payment_ref.is_empty() || payment_ref.len() > MAX_REF_LEN {
            return Err(EngineError::LimitExceeded("payment ref length"));
        }
        if !gateway::verify_signature(&self.cfg.gateway_secret, order_ref, payment_ref, signature) {
            metrics::counter!(crate::observability::SIGNATURE_FAILURES_TOTAL).increment(1);
            return Err(EngineError::SignatureInvalid {
                order_ref: order_ref.to_string(),
            });
        }
        let booking_id = self
            .order_index
            .get(order_ref)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::OrderNotFound(order_ref.to_string()))?;

        let (handle, resource_id, days) = self.peek_days(&booking_id).await?;
        let mut guards = self.lock_days(resource_id, &days).await;
        let mut b = handle.write_owned().await;
        match b.state {
            BookingState::AwaitingPayment => {
                let claims_lost = b.slots.iter().any(|slot| {
                    guards
                        .iter()
                        .find(|g| g.day == slot.day)
                        .is_none_or(|g| g.claimant(slot.hour) != Some(b.id))
                });
                if claims_lost {
                    let event = Event::BookingExpired { booking_id };
                    self.wal_append(&event).await?;
                    b.state = BookingState::Expired;
                    Self::release_claims(&mut guards, &b);
                    self.note_hold_released(&b.user_id);
                    metrics::counter!(crate::observability::BOOKINGS_EXPIRED_TOTAL).increment(1);
                    self.notify.send(resource_id, &event);
                    return Err(EngineError::AlreadyFinalized {
                        id: booking_id,
                        state: BookingState::Expired,
                    });
                }
                let event = Event::BookingPaid {
                    booking_id,
                    payment_ref: payment_ref.to_string(),
                };
                self.wal_append(&event).await?;
                b.state = BookingState::Paid;
                let order = b.order.as_mut().expect("awaiting payment implies order");
                order.status = OrderStatus::Verified;
                order.payment_ref = Some(payment_ref.to_string());
                self.note_hold_released(&b.user_id);
                metrics::counter!(crate::observability::BOOKINGS_PAID_TOTAL).increment(1);
                self.notify.send(b.resource_id, &event);
                Ok(BookingView::from(&*b))
            }
            // Gateway callbacks may be delivered more than once.
            BookingState::Paid => Ok(BookingView::from(&*b)),
            state if state.is_terminal() => Err(EngineError::AlreadyFinalized {
                id: booking_id,
                state,
            }),
            state => Err(EngineError::NotPending {
                id: booking_id,
                state,
            }),
        }
    }

    /// Record an explicit gateway failure: AwaitingPayment → Failed, slots
    /// released immediately (not deferred to the sweeper). A no-op when the
    /// booking is already terminal.
    pub async fn mark_failed(
        &self,
        order_ref: &str,
        reason: &str,
    ) -> Result<BookingView, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("failure reason length"));
        }
        let booking_id = self
            .order_index
            .get(order_ref)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::OrderNotFound(order_ref.to_string()))?;

        let (handle, resource_id, days) = self.peek_days(&booking_id).await?;
        let mut guards = self.lock_days(resource_id, &days).await;
        let mut b = handle.write_owned().await;
        match b.state {
            BookingState::AwaitingPayment => {
                let event = Event::BookingFailed {
                    booking_id,
                    reason: reason.to_string(),
                };
                self.wal_append(&event).await?;
                b.state = BookingState::Failed;
                if let Some(order) = b.order.as_mut() {
                    order.status = OrderStatus::VerificationFailed;
                }
                Self::release_claims(&mut guards, &b);
                self.note_hold_released(&b.user_id);
                metrics::counter!(crate::observability::BOOKINGS_FAILED_TOTAL).increment(1);
                self.notify.send(resource_id, &event);
                Ok(BookingView::from(&*b))
            }
            state if state.is_terminal() => Ok(BookingView::from(&*b)),
            state => Err(EngineError::NotPending {
                id: booking_id,
                state,
            }),
        }
    }
}

fn order_view(b: &Booking, order: &PaymentOrder) -> OrderView {
    OrderView {
        order_id: order.id,
        booking_id: b.id,
        gateway_ref: order.gateway_ref.clone(),
        amount_minor: order.amount_minor,
        currency: order.currency.clone(),
        status: order.status,
    }
}

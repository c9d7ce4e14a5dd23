//! Line-delimited JSON protocol. One request per line, one reply per line;
//! `watch` switches the connection to a push stream of resource events until
//! the client sends another line.
//!
//! Every connection must open with a `hello` carrying the shared password
//! before any other request is accepted.

use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::gateway::PaymentGateway;
use crate::limits::MAX_WIRE_LINE;
use crate::observability;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        password: String,
    },
    RegisterResource {
        name: String,
        tz_offset_minutes: i32,
        hourly_rate_minor: i64,
        currency: String,
    },
    Resources,
    Availability {
        resource_id: String,
        date: String,
    },
    Reserve {
        resource_id: String,
        date: String,
        slots: Vec<u8>,
        user_id: String,
    },
    Cancel {
        booking_id: String,
        user_id: String,
    },
    CreateOrder {
        booking_id: String,
    },
    PaymentCallback {
        order_ref: String,
        payment_ref: String,
        signature: String,
    },
    PaymentFailed {
        order_ref: String,
        reason: String,
    },
    Booking {
        booking_id: String,
    },
    Held,
    Sweep,
    Watch {
        resource_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok { data: serde_json::Value },
    Error { kind: String, message: String },
    Event { data: serde_json::Value },
}

impl Reply {
    fn ok(data: serde_json::Value) -> Self {
        Reply::Ok { data }
    }

    fn error(kind: &str, message: impl Into<String>) -> Self {
        Reply::Error {
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        if e.is_incident() {
            tracing::error!("{e}");
        }
        Reply::error(e.kind(), e.to_string())
    }
}

fn reply_of<T: Serialize>(result: Result<T, EngineError>) -> Reply {
    match result {
        Ok(v) => Reply::ok(json!(v)),
        Err(e) => Reply::from(e),
    }
}

/// Drive one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    gateway: Arc<dyn PaymentGateway>,
    password: Arc<str>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_LINE));

    // Handshake: first line must be a matching hello.
    match next_request(&mut framed).await? {
        Some(Request::Hello { password: given }) if given.as_str() == password.as_ref() => {
            send(&mut framed, &Reply::ok(json!({"server": "slotd"}))).await?;
        }
        Some(_) => {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            send(&mut framed, &Reply::error("auth", "authentication failed")).await?;
            return Ok(());
        }
        None => return Ok(()),
    }

    while let Some(request) = next_request(&mut framed).await? {
        if let Request::Watch { resource_id } = request {
            watch_loop(&mut framed, &engine, &resource_id).await?;
            continue;
        }

        let op = op_label(&request);
        let start = Instant::now();
        let reply = dispatch(request, &engine, gateway.as_ref()).await;
        let status = match reply {
            Reply::Ok { .. } => "ok",
            _ => "error",
        };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status)
            .increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        send(&mut framed, &reply).await?;
    }
    Ok(())
}

async fn dispatch(request: Request, engine: &Engine, gateway: &dyn PaymentGateway) -> Reply {
    match request {
        Request::Hello { .. } => Reply::error("validation", "already authenticated"),
        Request::RegisterResource {
            name,
            tz_offset_minutes,
            hourly_rate_minor,
            currency,
        } => reply_of(
            engine
                .register_resource(Ulid::new(), name, tz_offset_minutes, hourly_rate_minor, currency)
                .await,
        ),
        Request::Resources => Reply::ok(json!(engine.list_resources())),
        Request::Availability { resource_id, date } => {
            match (parse_ulid(&resource_id), parse_date(&date)) {
                (Ok(rid), Ok(date)) => reply_of(engine.availability(rid, date).await),
                (Err(e), _) | (_, Err(e)) => e,
            }
        }
        Request::Reserve {
            resource_id,
            date,
            slots,
            user_id,
        } => match (parse_ulid(&resource_id), parse_date(&date)) {
            (Ok(rid), Ok(date)) => reply_of(engine.reserve(rid, date, &slots, &user_id).await),
            (Err(e), _) | (_, Err(e)) => e,
        },
        Request::Cancel {
            booking_id,
            user_id,
        } => match parse_ulid(&booking_id) {
            Ok(id) => reply_of(engine.cancel(id, &user_id).await),
            Err(e) => e,
        },
        Request::CreateOrder { booking_id } => match parse_ulid(&booking_id) {
            Ok(id) => reply_of(engine.create_order(id, gateway).await),
            Err(e) => e,
        },
        Request::PaymentCallback {
            order_ref,
            payment_ref,
            signature,
        } => reply_of(engine.verify(&order_ref, &payment_ref, &signature).await),
        Request::PaymentFailed { order_ref, reason } => {
            reply_of(engine.mark_failed(&order_ref, &reason).await)
        }
        Request::Booking { booking_id } => match parse_ulid(&booking_id) {
            Ok(id) => reply_of(engine.get_booking(id).await),
            Err(e) => e,
        },
        Request::Held => Reply::ok(json!(engine.held_counts().await)),
        Request::Sweep => match engine.sweep(crate::localtime::now_ms()).await {
            Ok(n) => Reply::ok(json!({"expired": n})),
            Err(e) => Reply::from(e),
        },
        Request::Watch { .. } => unreachable!("watch handled by the connection loop"),
    }
}

/// Stream events for one resource until the client sends any line.
async fn watch_loop(
    framed: &mut Framed<TcpStream, LinesCodec>,
    engine: &Engine,
    resource_id: &str,
) -> Result<(), LinesCodecError> {
    let rid = match parse_ulid(resource_id) {
        Ok(rid) => rid,
        Err(e) => return send(framed, &e).await,
    };
    let mut rx = engine.notify.subscribe(rid);
    send(framed, &Reply::ok(json!({"watching": resource_id}))).await?;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    send(framed, &Reply::Event { data: json!(event) }).await?;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("watch on {rid} lagged, {n} events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            line = framed.next() => match line {
                Some(Ok(_)) => break,
                Some(Err(e)) => return Err(e),
                None => break,
            },
        }
    }
    send(framed, &Reply::ok(json!({"watching": serde_json::Value::Null}))).await
}

async fn next_request(
    framed: &mut Framed<TcpStream, LinesCodec>,
) -> Result<Option<Request>, LinesCodecError> {
    loop {
        let Some(line) = framed.next().await else {
            return Ok(None);
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(request) => return Ok(Some(request)),
            Err(e) => {
                debug!("malformed request: {e}");
                send(framed, &Reply::error("validation", format!("malformed request: {e}")))
                    .await?;
            }
        }
    }
}

async fn send(
    framed: &mut Framed<TcpStream, LinesCodec>,
    reply: &Reply,
) -> Result<(), LinesCodecError> {
    let line = serde_json::to_string(reply).expect("reply serializes");
    framed.send(line).await
}

fn parse_ulid(s: &str) -> Result<Ulid, Reply> {
    Ulid::from_string(s).map_err(|_| Reply::error("validation", format!("invalid id: {s}")))
}

fn parse_date(s: &str) -> Result<NaiveDate, Reply> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| Reply::error("validation", format!("invalid date: {s}")))
}

fn op_label(request: &Request) -> &'static str {
    match request {
        Request::Hello { .. } => "hello",
        Request::RegisterResource { .. } => "register_resource",
        Request::Resources => "resources",
        Request::Availability { .. } => "availability",
        Request::Reserve { .. } => "reserve",
        Request::Cancel { .. } => "cancel",
        Request::CreateOrder { .. } => "create_order",
        Request::PaymentCallback { .. } => "payment_callback",
        Request::PaymentFailed { .. } => "payment_failed",
        Request::Booking { .. } => "booking",
        Request::Held => "held",
        Request::Sweep => "sweep",
        Request::Watch { .. } => "watch",
    }
}

//! In-process stand-ins for the language model and the booking backend.
//!
//! `SandboxBookingApi` backs `concierge chat --sandbox` and the engine tests; it answers every
//! call deterministically and counts calls per operation. `ScriptedLlm` replays canned replies.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use concierge_core::domain::booking::{
    ContactReceipt, FlightDetails, FlightSchedule, PaymentReceipt, Reservation,
};
use concierge_core::domain::session::ChatMessage;
use serde_json::{json, Map, Value};

use crate::llm::{LlmClient, LlmError};
use crate::upstream::{BookingApi, ContactRequest, PaymentRequest, ReserveRequest, UpstreamError};

pub const GET_SCHEDULE: &str = "getschedule";
pub const RESERVE_CART: &str = "reservecartitem";
pub const SET_CONTACT: &str = "setcontact";
pub const MAKE_PAYMENT: &str = "makepayment";

#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let llm = Self::default();
        for reply in replies {
            llm.push_reply(reply);
        }
        llm
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: LlmError) {
        lock(&self.replies).push_back(Err(error));
    }

    /// Every message list the model was invoked with, oldest first.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn invoke(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        lock(&self.calls).push(messages.to_vec());
        lock(&self.replies).pop_front().unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// Deterministic booking backend. Every flight exists unless marked missing.
#[derive(Default)]
pub struct SandboxBookingApi {
    calls: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, usize>>,
    missing_flights: Mutex<BTreeSet<String>>,
    latency: Mutex<Option<Duration>>,
    next_schedule_id: AtomicI64,
    next_cart_item_id: AtomicI64,
    payments: AtomicUsize,
}

impl SandboxBookingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls made to `operation`, failed ones included.
    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.calls).get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    /// `getschedule` returns no rows for this flight.
    pub fn mark_flight_missing(&self, flight_id: &str) {
        lock(&self.missing_flights).insert(flight_id.trim().to_ascii_uppercase());
    }

    pub fn restore_flight(&self, flight_id: &str) {
        lock(&self.missing_flights).remove(&flight_id.trim().to_ascii_uppercase());
    }

    /// The next `times` calls to `operation` fail.
    pub fn fail_next(&self, operation: &'static str, times: usize) {
        lock(&self.failures).insert(operation, times);
    }

    /// Every call sleeps this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    async fn enter(&self, operation: &'static str) -> Result<(), UpstreamError> {
        *lock(&self.calls).entry(operation).or_insert(0) += 1;
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut failures = lock(&self.failures);
        match failures.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(UpstreamError::new(operation, "sandbox: injected failure"))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BookingApi for SandboxBookingApi {
    async fn get_schedule(&self, query: &FlightDetails) -> Result<Vec<FlightSchedule>, UpstreamError> {
        self.enter(GET_SCHEDULE).await?;
        let flight = query.flight_id.trim().to_ascii_uppercase();
        if lock(&self.missing_flights).contains(&flight) {
            return Ok(Vec::new());
        }
        let schedule_id = 1000 + self.next_schedule_id.fetch_add(1, Ordering::SeqCst);
        let mut extra = Map::new();
        extra.insert("direction".to_owned(), json!(query.direction.code()));
        extra.insert("airportid".to_owned(), json!(query.airport_id));
        extra.insert("traveldate".to_owned(), json!(query.travel_date));
        Ok(vec![FlightSchedule { schedule_id, flight_id: flight, extra }])
    }

    async fn reserve_cart(&self, request: &ReserveRequest) -> Result<Reservation, UpstreamError> {
        self.enter(RESERVE_CART).await?;
        let cart_item_id = 5000 + self.next_cart_item_id.fetch_add(1, Ordering::SeqCst);
        let mut extra = Map::new();
        extra.insert("productid".to_owned(), json!(request.product.as_str()));
        extra.insert("ticketsrequested".to_owned(), json!(request.tickets.total()));
        Ok(Reservation { cart_item_id, extra })
    }

    async fn set_contact(&self, request: &ContactRequest) -> Result<ContactReceipt, UpstreamError> {
        self.enter(SET_CONTACT).await?;
        let mut extra = Map::new();
        extra.insert("cartitemid".to_owned(), json!(request.cart_item_id));
        Ok(ContactReceipt { status: Some("OK".to_owned()), extra })
    }

    async fn make_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, UpstreamError> {
        self.enter(MAKE_PAYMENT).await?;
        let sequence = self.payments.fetch_add(1, Ordering::SeqCst) + 1;
        let mut extra = Map::new();
        extra.insert("cartitemid".to_owned(), Value::from(request.cart_item_id));
        extra.insert("card".to_owned(), json!(request.payment.masked_number()));
        Ok(PaymentReceipt {
            transaction_id: format!("SBX-{}-{sequence}", request.cart_item_id),
            status: Some("APPROVED".to_owned()),
            extra,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

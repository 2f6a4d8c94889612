//! Booking backend client.
//!
//! Every endpoint takes a JSON POST wrapped in `{username, sessionid, failstatus, request}` and
//! answers `{data: ...}`. Non-2xx statuses and bodies without the expected `data` shape are
//! reported as `UpstreamError`.

use std::time::Duration;

use async_trait::async_trait;
use concierge_core::config::BookingApiConfig;
use concierge_core::domain::booking::{
    ContactDetails, ContactReceipt, FlightDetails, FlightSchedule, PaymentDetails,
    PaymentReceipt, ProductKind, Reservation, TicketCounts,
};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("upstream `{operation}` failed: {cause}")]
pub struct UpstreamError {
    pub operation: String,
    pub cause: String,
}

impl UpstreamError {
    pub fn new(operation: impl Into<String>, cause: impl Into<String>) -> Self {
        Self { operation: operation.into(), cause: cause.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub product: ProductKind,
    /// `0` when the product has no arrival leg.
    pub arrival_schedule_id: i64,
    /// `0` when the product has no departure leg.
    pub departure_schedule_id: i64,
    pub tickets: TicketCounts,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRequest {
    pub cart_item_id: i64,
    pub contact: ContactDetails,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub cart_item_id: i64,
    pub payment: PaymentDetails,
}

#[async_trait]
pub trait BookingApi: Send + Sync {
    /// Schedules for the query's airport and date, narrowed to its flight.
    async fn get_schedule(&self, query: &FlightDetails) -> Result<Vec<FlightSchedule>, UpstreamError>;
    async fn reserve_cart(&self, request: &ReserveRequest) -> Result<Reservation, UpstreamError>;
    async fn set_contact(&self, request: &ContactRequest) -> Result<ContactReceipt, UpstreamError>;
    async fn make_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, UpstreamError>;
}

pub struct HttpBookingApi {
    client: Client,
    base_url: String,
    username: String,
    session_token: Option<SecretString>,
}

impl HttpBookingApi {
    pub fn from_config(config: &BookingApiConfig) -> Result<Self, UpstreamError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| UpstreamError::new("configure", "booking_api.base_url is not set"))?;
        let username = config
            .username
            .clone()
            .ok_or_else(|| UpstreamError::new("configure", "booking_api.username is not set"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| UpstreamError::new("configure", error.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            username,
            session_token: config.session_token.clone(),
        })
    }

    fn envelope(&self, request: Value) -> Value {
        json!({
            "username": self.username,
            "sessionid": self.session_token.as_ref().map(|token| token.expose_secret().to_owned()).unwrap_or_default(),
            "failstatus": 0,
            "request": request,
        })
    }

    async fn post(&self, endpoint: &str, request: Value) -> Result<Value, UpstreamError> {
        let url = format!("{}/{endpoint}", self.base_url);
        debug!(event_name = "upstream.request", endpoint, "calling booking backend");

        let response = self
            .client
            .post(&url)
            .json(&self.envelope(request))
            .send()
            .await
            .map_err(|error| UpstreamError::new(endpoint, error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::new(endpoint, format!("status {}: {body}", status.as_u16())));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|error| UpstreamError::new(endpoint, format!("malformed body: {error}")))?;
        match body {
            Value::Object(mut object) => object
                .remove("data")
                .filter(|data| !data.is_null())
                .ok_or_else(|| UpstreamError::new(endpoint, "response has no `data`")),
            _ => Err(UpstreamError::new(endpoint, "response is not a JSON object")),
        }
    }
}

#[async_trait]
impl BookingApi for HttpBookingApi {
    async fn get_schedule(&self, query: &FlightDetails) -> Result<Vec<FlightSchedule>, UpstreamError> {
        let data = self
            .post(
                "getschedule",
                json!({
                    "direction": query.direction.code(),
                    "airportid": query.airport_id,
                    "traveldate": query.travel_date,
                }),
            )
            .await?;
        let rows = data
            .get("flightschedule")
            .cloned()
            .ok_or_else(|| UpstreamError::new("getschedule", "response has no `flightschedule`"))?;
        let schedules: Vec<FlightSchedule> = serde_json::from_value(rows)
            .map_err(|error| UpstreamError::new("getschedule", format!("malformed schedule: {error}")))?;
        Ok(matching_flight(schedules, &query.flight_id))
    }

    async fn reserve_cart(&self, request: &ReserveRequest) -> Result<Reservation, UpstreamError> {
        let data = self
            .post(
                "reservecartitem",
                json!({
                    "adulttickets": request.tickets.adults,
                    "arrivalscheduleid": request.arrival_schedule_id,
                    "cartitemid": 0,
                    "childtickets": request.tickets.children,
                    "departurescheduleid": request.departure_schedule_id,
                    "distributorid": "",
                    "paymenttype": "GUESTCARD",
                    "productid": request.product.as_str(),
                    "ticketsrequested": request.tickets.total(),
                }),
            )
            .await?;
        serde_json::from_value(data)
            .map_err(|error| UpstreamError::new("reservecartitem", format!("malformed reservation: {error}")))
    }

    async fn set_contact(&self, request: &ContactRequest) -> Result<ContactReceipt, UpstreamError> {
        let contact = &request.contact;
        let data = self
            .post(
                "setcontact",
                json!({
                    "contact": {
                        "cartitemid": request.cart_item_id,
                        "email": contact.email,
                        "firstname": contact.first_name,
                        "lastname": contact.last_name,
                        "phone": contact.phone,
                        "title": contact.title,
                    }
                }),
            )
            .await?;
        match data {
            Value::Object(extra) => serde_json::from_value(Value::Object(extra)).map_err(|error| {
                UpstreamError::new("setcontact", format!("malformed receipt: {error}"))
            }),
            other => Ok(ContactReceipt { status: other.as_str().map(str::to_owned), extra: Map::new() }),
        }
    }

    async fn make_payment(&self, request: &PaymentRequest) -> Result<PaymentReceipt, UpstreamError> {
        let payment = &request.payment;
        let data = self
            .post(
                "makepayment",
                json!({
                    "cartitemid": request.cart_item_id,
                    "payment": {
                        "cardholder": payment.card_holder,
                        "cardnumber": payment.card_number,
                        "cardtype": payment.card_type,
                        "expirydate": payment.expiry_date,
                        "cvv": payment.cvv,
                    }
                }),
            )
            .await?;
        serde_json::from_value(data)
            .map_err(|error| UpstreamError::new("makepayment", format!("malformed receipt: {error}")))
    }
}

pub(crate) fn matching_flight(schedules: Vec<FlightSchedule>, flight_id: &str) -> Vec<FlightSchedule> {
    schedules
        .into_iter()
        .filter(|schedule| schedule.flight_id.trim().eq_ignore_ascii_case(flight_id.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use concierge_core::config::{BookingApiConfig, BookingApiMode};
    use concierge_core::domain::booking::FlightSchedule;
    use serde_json::json;

    use super::{matching_flight, HttpBookingApi};

    #[test]
    fn schedule_rows_are_narrowed_to_the_requested_flight() {
        let rows: Vec<FlightSchedule> = serde_json::from_value(json!([
            {"scheduleId": 11, "flightId": "AC920", "airline": "Air Canada"},
            {"scheduleId": 12, "flightId": "BW600"},
        ]))
        .expect("rows");

        let matching = matching_flight(rows, "ac920 ");

        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].schedule_id, 11);
        assert_eq!(matching[0].extra.get("airline"), Some(&json!("Air Canada")));
    }

    #[test]
    fn envelope_wraps_request_with_credentials() {
        let api = HttpBookingApi::from_config(&BookingApiConfig {
            mode: BookingApiMode::Http,
            base_url: Some("https://booking.example.test/api/".to_string()),
            username: Some("agent".to_string()),
            session_token: Some("token-1".to_string().into()),
            timeout_secs: 5,
        })
        .expect("client");

        let envelope = api.envelope(json!({"airportid": "SIA"}));

        assert_eq!(envelope["username"], "agent");
        assert_eq!(envelope["sessionid"], "token-1");
        assert_eq!(envelope["failstatus"], 0);
        assert_eq!(envelope["request"]["airportid"], "SIA");
        assert_eq!(api.base_url, "https://booking.example.test/api");
    }

    #[test]
    fn missing_base_url_is_rejected() {
        let result = HttpBookingApi::from_config(&BookingApiConfig {
            mode: BookingApiMode::Http,
            base_url: None,
            username: Some("agent".to_string()),
            session_token: None,
            timeout_secs: 5,
        });
        assert!(result.is_err());
    }
}

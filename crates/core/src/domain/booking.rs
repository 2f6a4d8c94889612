use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::slots::{GroupKey, SlotRecord};

/// Travel direction for a lounge visit. Serialized with the upstream codes `A` and `D`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "A")]
    Arrival,
    #[serde(rename = "D")]
    Departure,
}

impl Direction {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Arrival => "A",
            Self::Departure => "D",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Arrival => "arrival",
            Self::Departure => "departure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "A" | "ARRIVAL" => Some(Self::Arrival),
            "D" | "DEPARTURE" => Some(Self::Departure),
            _ => None,
        }
    }

    pub fn group(&self) -> GroupKey {
        match self {
            Self::Arrival => GroupKey::Arrival,
            Self::Departure => GroupKey::Departure,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Lounge product sold by the booking service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductKind {
    #[serde(rename = "ARRIVALONLY")]
    ArrivalOnly,
    #[serde(rename = "DEPARTURE")]
    Departure,
    #[serde(rename = "ARRIVALBUNDLE")]
    ArrivalBundle,
}

impl ProductKind {
    pub const ALL: [ProductKind; 3] = [Self::ArrivalOnly, Self::Departure, Self::ArrivalBundle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ArrivalOnly => "ARRIVALONLY",
            Self::Departure => "DEPARTURE",
            Self::ArrivalBundle => "ARRIVALBUNDLE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace(['_', ' ', '-'], "").as_str() {
            "ARRIVALONLY" | "ARRIVAL" => Some(Self::ArrivalOnly),
            "DEPARTURE" | "DEPARTUREONLY" => Some(Self::Departure),
            "ARRIVALBUNDLE" | "BUNDLE" => Some(Self::ArrivalBundle),
            _ => None,
        }
    }

    /// Directions whose itinerary must be collected, in collection order.
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            Self::ArrivalOnly => &[Direction::Arrival],
            Self::Departure => &[Direction::Departure],
            Self::ArrivalBundle => &[Direction::Arrival, Direction::Departure],
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::ArrivalOnly => "arrival lounge",
            Self::Departure => "departure lounge",
            Self::ArrivalBundle => "arrival and departure lounge bundle",
        }
    }
}

impl fmt::Display for ProductKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketCounts {
    pub adults: u32,
    pub children: u32,
}

impl TicketCounts {
    pub fn total(&self) -> u32 {
        self.adults.saturating_add(self.children)
    }

    pub fn from_record(record: &SlotRecord) -> Option<Self> {
        Some(Self { adults: record.get_u32("adulttickets")?, children: record.get_u32("childtickets")? })
    }
}

/// Flight details for one direction, read from a committed itinerary group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightDetails {
    pub direction: Direction,
    pub airport_id: String,
    pub travel_date: String,
    pub flight_id: String,
}

impl FlightDetails {
    pub fn from_record(direction: Direction, record: &SlotRecord) -> Option<Self> {
        Some(Self {
            direction,
            airport_id: record.get_str("airportid")?.to_owned(),
            travel_date: record.get_str("traveldate")?.to_owned(),
            flight_id: record.get_str("flightId")?.to_owned(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub title: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

impl ContactDetails {
    pub fn from_record(record: &SlotRecord) -> Option<Self> {
        Some(Self {
            title: record.get_str("title")?.to_owned(),
            first_name: record.get_str("firstname")?.to_owned(),
            last_name: record.get_str("lastname")?.to_owned(),
            email: record.get_str("email")?.to_owned(),
            phone: record.get_str("phone")?.to_owned(),
        })
    }
}

/// Card details collected for the final payment. `Debug` never prints the card number or CVV.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub card_holder: String,
    pub card_number: String,
    pub card_type: String,
    pub expiry_date: String,
    pub cvv: String,
}

impl PaymentDetails {
    pub fn from_record(record: &SlotRecord) -> Option<Self> {
        Some(Self {
            card_holder: record.get_str("cardHolder")?.to_owned(),
            card_number: record.get_str("cardNumber")?.to_owned(),
            card_type: record.get_str("cardType")?.to_owned(),
            expiry_date: record.get_str("expiryDate")?.to_owned(),
            cvv: record.get_str("cvv")?.to_owned(),
        })
    }

    pub fn masked_number(&self) -> String {
        mask_card_number(&self.card_number)
    }
}

impl fmt::Debug for PaymentDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentDetails")
            .field("card_holder", &self.card_holder)
            .field("card_number", &self.masked_number())
            .field("card_type", &self.card_type)
            .field("expiry_date", &self.expiry_date)
            .field("cvv", &"***")
            .finish()
    }
}

pub fn mask_card_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(char::is_ascii_digit).collect();
    let tail: String = digits.iter().skip(digits.len().saturating_sub(4)).collect();
    format!("**** {tail}")
}

/// One schedule row returned by the upstream `getschedule` endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlightSchedule {
    pub schedule_id: i64,
    pub flight_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "cartitemid")]
    pub cart_item_id: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactReceipt {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    #[serde(rename = "transactionid", alias = "transactionId")]
    pub transaction_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named group of related slots. Groups are committed as a unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKey {
    #[serde(rename = "flow")]
    Flow,
    #[serde(rename = "product")]
    Product,
    #[serde(rename = "A")]
    Arrival,
    #[serde(rename = "D")]
    Departure,
    #[serde(rename = "tickets")]
    Tickets,
    #[serde(rename = "contact")]
    Contact,
    #[serde(rename = "payment")]
    Payment,
    #[serde(rename = "confirmation")]
    Confirmation,
}

impl GroupKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flow => "flow",
            Self::Product => "product",
            Self::Arrival => "A",
            Self::Departure => "D",
            Self::Tickets => "tickets",
            Self::Contact => "contact",
            Self::Payment => "payment",
            Self::Confirmation => "confirmation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "flow" => Some(Self::Flow),
            "product" => Some(Self::Product),
            "A" | "a" | "arrival" => Some(Self::Arrival),
            "D" | "d" | "departure" => Some(Self::Departure),
            "tickets" => Some(Self::Tickets),
            "contact" => Some(Self::Contact),
            "payment" => Some(Self::Payment),
            "confirmation" => Some(Self::Confirmation),
            _ => None,
        }
    }

    pub fn is_itinerary(&self) -> bool {
        matches!(self, Self::Arrival | Self::Departure)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field values for one slot group. Absent fields are simply missing; `null` is never stored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotRecord {
    fields: BTreeMap<String, Value>,
}

impl SlotRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        if value.is_null() {
            return;
        }
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        match self.fields.get(name)? {
            Value::Number(number) => number.as_u64().and_then(|value| u32::try_from(value).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.fields.get(name).and_then(Value::as_bool)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Overlays `newer` onto this record field by field; fields absent from `newer` survive.
    pub fn merged_with(&self, newer: &SlotRecord) -> SlotRecord {
        let mut merged = self.clone();
        for (name, value) in &newer.fields {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }
}

impl FromIterator<(String, Value)> for SlotRecord {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut record = SlotRecord::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

//! Slot schema registry.
//!
//! Declares, per sub-flow, which slot groups must be collected and how each field is fixed up
//! and validated. The extraction adapter builds its instructions from these schemas and the
//! collector nodes validate against them before committing a group.

pub mod validators;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::domain::booking::ProductKind;
use crate::domain::slots::{GroupKey, SlotRecord};

pub use validators::{
    validate_group, FieldIssue, FieldProblem, Fixup, ValidationError, Validator,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Intent,
    Product,
    ArrivalItinerary,
    DepartureItinerary,
    BundleItinerary,
    Contact,
    Payment,
    Confirmation,
}

impl FlowKind {
    pub const ALL: [FlowKind; 8] = [
        Self::Intent,
        Self::Product,
        Self::ArrivalItinerary,
        Self::DepartureItinerary,
        Self::BundleItinerary,
        Self::Contact,
        Self::Payment,
        Self::Confirmation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Product => "product",
            Self::ArrivalItinerary => "arrival_itinerary",
            Self::DepartureItinerary => "departure_itinerary",
            Self::BundleItinerary => "bundle_itinerary",
            Self::Contact => "contact",
            Self::Payment => "payment",
            Self::Confirmation => "confirmation",
        }
    }

    pub fn is_itinerary(&self) -> bool {
        matches!(self, Self::ArrivalItinerary | Self::DepartureItinerary | Self::BundleItinerary)
    }

    pub fn itinerary_for(product: ProductKind) -> Self {
        match product {
            ProductKind::ArrivalOnly => Self::ArrivalItinerary,
            ProductKind::Departure => Self::DepartureItinerary,
            ProductKind::ArrivalBundle => Self::BundleItinerary,
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Human-readable description, shown to the model and used in re-prompts.
    pub hint: &'static str,
    pub validator: Validator,
    /// Applied in order before validation.
    pub fixups: &'static [Fixup],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSchema {
    pub key: GroupKey,
    pub fields: Vec<FieldSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowSchema {
    pub kind: FlowKind,
    pub goal: &'static str,
    pub groups: Vec<GroupSchema>,
}

impl FlowSchema {
    pub fn required_groups(&self) -> impl Iterator<Item = GroupKey> + '_ {
        self.groups.iter().map(|group| group.key)
    }

    pub fn declares(&self, group: GroupKey) -> bool {
        self.groups.iter().any(|candidate| candidate.key == group)
    }

    pub fn fields(&self, group: GroupKey) -> Option<&[FieldSpec]> {
        self.groups
            .iter()
            .find(|candidate| candidate.key == group)
            .map(|candidate| candidate.fields.as_slice())
    }

    /// Group declaring a field with this name, if exactly one group does.
    pub fn group_of_field(&self, name: &str) -> Option<GroupKey> {
        let mut owners = self
            .groups
            .iter()
            .filter(|group| group.fields.iter().any(|field| field.name == name))
            .map(|group| group.key);
        let first = owners.next()?;
        owners.next().is_none().then_some(first)
    }

    pub fn missing_groups(&self, collected: &BTreeMap<GroupKey, SlotRecord>) -> Vec<GroupKey> {
        self.required_groups().filter(|group| !collected.contains_key(group)).collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SlotSchemaRegistry {
    schemas: BTreeMap<FlowKind, FlowSchema>,
}

impl SlotSchemaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Schemas for the lounge booking conversation.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(FlowSchema {
            kind: FlowKind::Intent,
            goal: "Decide whether the customer wants to book a lounge or is asking a general question.",
            groups: vec![GroupSchema {
                key: GroupKey::Flow,
                fields: vec![FieldSpec {
                    name: "flow",
                    hint: "booking when the customer wants to book anything, otherwise general",
                    validator: Validator::OneOf(&["booking", "general"]),
                    fixups: &[Fixup::Trim],
                }],
            }],
        });
        registry.register(FlowSchema {
            kind: FlowKind::Product,
            goal: "Find out whether the customer wants lounge access for arrival, departure, or both. \
                   Map the answer to a product id but never mention product ids to the customer.",
            groups: vec![GroupSchema {
                key: GroupKey::Product,
                fields: vec![FieldSpec {
                    name: "productid",
                    hint: "ARRIVALONLY, DEPARTURE or ARRIVALBUNDLE",
                    validator: Validator::OneOf(&["ARRIVALONLY", "DEPARTURE", "ARRIVALBUNDLE"]),
                    fixups: &[Fixup::StripWhitespace, Fixup::Uppercase],
                }],
            }],
        });
        registry.register(itinerary_schema(
            FlowKind::ArrivalItinerary,
            "Collect the arrival flight details and the number of tickets.",
            &[GroupKey::Arrival],
        ));
        registry.register(itinerary_schema(
            FlowKind::DepartureItinerary,
            "Collect the departure flight details and the number of tickets.",
            &[GroupKey::Departure],
        ));
        registry.register(itinerary_schema(
            FlowKind::BundleItinerary,
            "Collect the arrival and departure flight details. Tickets are collected once and \
             apply to both directions.",
            &[GroupKey::Arrival, GroupKey::Departure],
        ));
        registry.register(FlowSchema {
            kind: FlowKind::Contact,
            goal: "Collect the contact details of the lead passenger.",
            groups: vec![GroupSchema { key: GroupKey::Contact, fields: contact_fields() }],
        });
        registry.register(FlowSchema {
            kind: FlowKind::Payment,
            goal: "Collect the card details used to pay for the booking.",
            groups: vec![GroupSchema { key: GroupKey::Payment, fields: payment_fields() }],
        });
        registry.register(FlowSchema {
            kind: FlowKind::Confirmation,
            goal: "Ask the customer to confirm the summarised booking with a clear yes or no.",
            groups: vec![GroupSchema {
                key: GroupKey::Confirmation,
                fields: vec![FieldSpec {
                    name: "confirmed",
                    hint: "true when the customer says yes, false when they decline",
                    validator: Validator::Boolean,
                    fixups: &[],
                }],
            }],
        });
        registry
    }

    pub fn register(&mut self, schema: FlowSchema) {
        self.schemas.insert(schema.kind, schema);
    }

    pub fn describe(&self, kind: FlowKind) -> Result<&FlowSchema, ConfigError> {
        self.schemas
            .get(&kind)
            .ok_or_else(|| ConfigError::UnknownFlowKind { flow: kind.as_str().to_owned() })
    }

    pub fn contains(&self, kind: FlowKind) -> bool {
        self.schemas.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = FlowKind> + '_ {
        self.schemas.keys().copied()
    }

    /// Field list for a group from whichever schema declares it.
    pub fn fields(&self, group: GroupKey) -> Option<&[FieldSpec]> {
        self.schemas.values().find_map(|schema| schema.fields(group))
    }
}

fn itinerary_schema(kind: FlowKind, goal: &'static str, directions: &[GroupKey]) -> FlowSchema {
    let groups = directions
        .iter()
        .map(|direction| GroupSchema { key: *direction, fields: itinerary_fields() })
        .chain(std::iter::once(GroupSchema { key: GroupKey::Tickets, fields: ticket_fields() }))
        .collect();
    FlowSchema { kind, goal, groups }
}

fn itinerary_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            name: "airportid",
            hint: "airport code, SIA or NMIA",
            validator: Validator::OneOf(&["SIA", "NMIA"]),
            fixups: &[Fixup::Uppercase],
        },
        FieldSpec {
            name: "traveldate",
            hint: "travel date as YYYYMMDD",
            validator: Validator::CalendarDate,
            fixups: &[Fixup::DigitsOnly],
        },
        FieldSpec {
            name: "flightId",
            hint: "flight number, for example AA123",
            validator: Validator::NonEmpty,
            fixups: &[Fixup::StripWhitespace, Fixup::Uppercase],
        },
    ]
}

fn ticket_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            name: "adulttickets",
            hint: "number of adults, at least 1",
            validator: Validator::TicketCount { min: 1, max: 20 },
            fixups: &[Fixup::Trim],
        },
        FieldSpec {
            name: "childtickets",
            hint: "number of children, 0 if none",
            validator: Validator::TicketCount { min: 0, max: 20 },
            fixups: &[Fixup::Trim],
        },
    ]
}

fn contact_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            name: "title",
            hint: "MR, MRS, MS, MISS or DR",
            validator: Validator::OneOf(&["MR", "MRS", "MS", "MISS", "DR"]),
            fixups: &[Fixup::Uppercase],
        },
        FieldSpec {
            name: "firstname",
            hint: "first name",
            validator: Validator::NonEmpty,
            fixups: &[Fixup::Trim],
        },
        FieldSpec {
            name: "lastname",
            hint: "last name",
            validator: Validator::NonEmpty,
            fixups: &[Fixup::Trim],
        },
        FieldSpec {
            name: "email",
            hint: "email address such as name@example.com",
            validator: Validator::Email,
            fixups: &[Fixup::StripWhitespace],
        },
        FieldSpec {
            name: "phone",
            hint: "phone number with at least 10 digits",
            validator: Validator::Phone,
            fixups: &[Fixup::Trim],
        },
    ]
}

fn payment_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            name: "cardHolder",
            hint: "name printed on the card",
            validator: Validator::NonEmpty,
            fixups: &[Fixup::Trim],
        },
        FieldSpec {
            name: "cardNumber",
            hint: "card number, 13 to 19 digits",
            validator: Validator::CardNumber,
            fixups: &[Fixup::DigitsOnly],
        },
        FieldSpec {
            name: "cardType",
            hint: "VISA or MASTERCARD",
            validator: Validator::OneOf(&["VISA", "MASTERCARD"]),
            fixups: &[Fixup::StripWhitespace, Fixup::Uppercase],
        },
        FieldSpec {
            name: "expiryDate",
            hint: "expiry as MM/YY",
            validator: Validator::CardExpiry,
            fixups: &[Fixup::StripWhitespace],
        },
        FieldSpec {
            name: "cvv",
            hint: "3 or 4 digit security code",
            validator: Validator::Cvv,
            fixups: &[Fixup::DigitsOnly],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::{FlowKind, SlotSchemaRegistry};
    use crate::config::ConfigError;
    use crate::domain::booking::ProductKind;
    use crate::domain::slots::GroupKey;

    #[test]
    fn standard_registry_covers_every_flow_kind() {
        let registry = SlotSchemaRegistry::standard();
        for kind in FlowKind::ALL {
            assert!(registry.describe(kind).is_ok(), "missing schema for {kind}");
        }
    }

    #[test]
    fn bundle_itinerary_requires_both_directions_and_tickets_once() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry
            .describe(FlowKind::itinerary_for(ProductKind::ArrivalBundle))
            .expect("bundle schema");

        let groups: Vec<GroupKey> = schema.required_groups().collect();
        assert_eq!(groups, vec![GroupKey::Arrival, GroupKey::Departure, GroupKey::Tickets]);
        assert_eq!(schema.group_of_field("adulttickets"), Some(GroupKey::Tickets));
        // flightId lives in both direction groups, so it has no single owner
        assert_eq!(schema.group_of_field("flightId"), None);
    }

    #[test]
    fn unknown_flow_kind_is_a_config_error() {
        let registry = SlotSchemaRegistry::empty();
        let error = registry.describe(FlowKind::Payment).expect_err("empty registry");
        assert!(matches!(error, ConfigError::UnknownFlowKind { ref flow } if flow == "payment"));
    }

    #[test]
    fn single_direction_itinerary_tracks_missing_groups() {
        let registry = SlotSchemaRegistry::standard();
        let schema = registry.describe(FlowKind::DepartureItinerary).expect("departure schema");
        let collected = std::collections::BTreeMap::new();
        assert_eq!(schema.missing_groups(&collected), vec![GroupKey::Departure, GroupKey::Tickets]);
    }
}

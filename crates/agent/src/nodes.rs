//! Node bodies for the booking graph.
//!
//! A node reads the session, may call the extraction adapter or the side-effect gateway, and
//! answers with a state delta plus either a message (continue) or a prompt (suspend). Nodes
//! never mutate the session themselves and never pick their successor; routing belongs to the
//! flow engine.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use concierge_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use concierge_core::config::ConfigError;
use concierge_core::domain::booking::{
    mask_card_number, ContactDetails, Direction, FlightDetails, PaymentDetails, ProductKind,
    TicketCounts,
};
use concierge_core::domain::session::{FlowBranch, Session, SessionStatus};
use concierge_core::domain::slots::{GroupKey, SlotRecord};
use concierge_core::errors::FailureKind;
use concierge_core::flows::{NodeId, StateDelta};
use concierge_core::ledger::LedgerError;
use concierge_core::slots::{validate_group, FlowKind, FlowSchema, SlotSchemaRegistry, ValidationError};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::extraction::{ExtractionAdapter, ExtractionError, InstructionBuilder};
use crate::gateway::{GatewayError, SideEffectGateway};
use crate::upstream::{ContactRequest, PaymentRequest, ReserveRequest, UpstreamError};

const GENERAL_INSTRUCTION: &str = "You are a friendly assistant for an airport lounge service. \
    Answer the customer's question briefly. If they later want to book, tell them to start a \
    new conversation and say they want to book a lounge.";
const DECLINED_MESSAGE: &str =
    "No problem, I've cancelled this booking. Nothing has been charged.";
const COMPLETED_MESSAGE: &str = "All done! Your lounge booking is confirmed. Enjoy your trip.";

#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutcome {
    /// The node finished; the engine merges the delta and routes onward.
    Continue { delta: StateDelta, message: Option<String> },
    /// The node needs user input; the turn ends with this node as the continuation point.
    Suspend { delta: StateDelta, prompt: String },
}

#[derive(Debug, Error)]
pub enum NodeFailure {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session state is inconsistent: {0}")]
    Corrupt(String),
}

impl From<GatewayError> for NodeFailure {
    fn from(value: GatewayError) -> Self {
        match value {
            GatewayError::Upstream(error) => Self::Upstream(error),
            GatewayError::Ledger(error) => Self::Ledger(error),
        }
    }
}

impl NodeFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Extraction(_) => FailureKind::Extraction,
            Self::Upstream(_) | Self::Ledger(LedgerError::Storage(_)) => FailureKind::Upstream,
            Self::Ledger(_) | Self::Corrupt(_) => FailureKind::CorruptSession,
            Self::Config(_) => FailureKind::Config,
        }
    }
}

pub struct NodeExecutor {
    registry: SlotSchemaRegistry,
    adapter: ExtractionAdapter,
    gateway: SideEffectGateway,
    collect_payment: bool,
}

impl NodeExecutor {
    pub fn new(
        registry: SlotSchemaRegistry,
        adapter: ExtractionAdapter,
        gateway: SideEffectGateway,
        collect_payment: bool,
    ) -> Self {
        Self { registry, adapter, gateway, collect_payment }
    }

    pub fn registry(&self) -> &SlotSchemaRegistry {
        &self.registry
    }

    pub async fn run(
        &self,
        node: NodeId,
        session: &Session,
        audit: &AuditContext,
        sink: &dyn AuditSink,
    ) -> Result<NodeOutcome, NodeFailure> {
        debug!(
            event_name = "flow.node.enter",
            correlation_id = %audit.correlation_id,
            session_id = %session.id,
            node = %node,
            "executing node"
        );
        match node {
            NodeId::Classify
            | NodeId::ProductType
            | NodeId::InfoCollector(_)
            | NodeId::ContactInfo
            | NodeId::Payment
            | NodeId::Confirm => self.collect(node, session, audit, sink).await,
            NodeId::General => self.general(session).await,
            NodeId::ScheduleCall => self.schedule_call(session, audit).await,
            NodeId::Reserve => self.reserve(session, audit).await,
            NodeId::SetContact => self.set_contact(session, audit).await,
            NodeId::MakePayment => self.make_payment(session, audit).await,
            NodeId::End => Ok(end(session)),
        }
    }

    /// First question a prompting node asks when the turn's chain arrives at it.
    pub fn opening_prompt(&self, node: NodeId, session: &Session) -> Option<String> {
        let (lead, groups) = match node {
            NodeId::Classify => {
                return Some("Hi! I can help you book airport lounge access. What can I do for you?".to_owned())
            }
            NodeId::ProductType => {
                return Some(
                    "Would you like lounge access for your arrival, your departure, or both?".to_owned(),
                )
            }
            NodeId::Confirm => {
                return Some(format!(
                    "{}\nShall I go ahead and confirm this booking? (yes/no)",
                    booking_summary(session, self.collect_payment)
                ))
            }
            NodeId::InfoCollector(direction) => {
                let mut groups = vec![direction.group()];
                if !session.is_committed(GroupKey::Tickets) {
                    groups.push(GroupKey::Tickets);
                }
                (format!("Please share your {} flight details:", direction.label()), groups)
            }
            NodeId::ContactInfo => {
                ("Who is the lead passenger? I need:".to_owned(), vec![GroupKey::Contact])
            }
            NodeId::Payment => {
                ("Please provide the card details for payment:".to_owned(), vec![GroupKey::Payment])
            }
            _ => return None,
        };

        let mut lines = vec![lead];
        for group in groups {
            let known = session.draft(group);
            for field in self.registry.fields(group).unwrap_or_default() {
                if known.is_some_and(|draft| draft.contains(field.name)) {
                    continue;
                }
                lines.push(format!("- {}", field.hint));
            }
        }
        Some(lines.join("\n"))
    }

    /// Slot-filling shared by every prompting node. Partial values are kept as drafts; a group
    /// is committed only when the adapter reports done and the group validates.
    async fn collect(
        &self,
        node: NodeId,
        session: &Session,
        audit: &AuditContext,
        sink: &dyn AuditSink,
    ) -> Result<NodeOutcome, NodeFailure> {
        let kind = flow_kind(node, session)?;
        let schema = self.registry.describe(kind)?;
        let targets = pending_groups(node, schema, session);

        let mut builder = InstructionBuilder::new(schema, targets.clone());
        for group in schema.required_groups() {
            if let Some(record) = session.committed(group).or_else(|| session.draft(group)) {
                builder = builder.known(group, &redacted(group, record));
            }
        }
        if node == NodeId::Confirm {
            builder = builder.context(booking_summary(session, self.collect_payment));
        }
        if let NodeId::InfoCollector(direction) = node {
            builder = builder.context(format!(
                "The current step is the {} flight. Tickets are collected once and reused for \
                 every direction.",
                direction.label()
            ));
        }

        let result = self.adapter.extract(&session.history, &builder.build(), schema).await?;
        sink.emit(
            audit
                .event("extraction.completed", AuditCategory::Extraction, AuditOutcome::Success)
                .with_metadata("node", node.as_str())
                .with_metadata("done", result.done.to_string()),
        );

        let mut delta = StateDelta { extraction_succeeded: true, ..StateDelta::default() };
        let mut fresh: BTreeMap<GroupKey, SlotRecord> = BTreeMap::new();
        for (group, record) in result.collected {
            if session.is_committed(group) {
                debug!(group = %group, "ignoring extracted values for a committed group");
                continue;
            }
            fresh.insert(group, record);
        }

        if !result.done {
            delta.drafts = fresh;
            return Ok(NodeOutcome::Suspend { delta, prompt: result.message });
        }

        let today = Utc::now().date_naive();
        let mut failures: Vec<ValidationError> = Vec::new();
        for group in &targets {
            let fields = schema.fields(*group).unwrap_or_default();
            let candidate = merged_candidate(session, &fresh, *group);
            match validate_group(*group, fields, &candidate, today) {
                Ok(normalized) => {
                    fresh.remove(group);
                    delta.commits.insert(*group, normalized);
                }
                Err(error) => failures.push(error),
            }
        }
        // Other groups the customer volunteered are committed too when they already validate.
        let volunteered: Vec<GroupKey> =
            fresh.keys().copied().filter(|group| !targets.contains(group)).collect();
        for group in volunteered {
            let fields = schema.fields(group).unwrap_or_default();
            let candidate = merged_candidate(session, &fresh, group);
            if let Ok(normalized) = validate_group(group, fields, &candidate, today) {
                fresh.remove(&group);
                delta.commits.insert(group, normalized);
            }
        }
        delta.drafts = fresh;

        if !failures.is_empty() {
            sink.emit(
                audit
                    .event("extraction.validation_failed", AuditCategory::Extraction, AuditOutcome::Rejected)
                    .with_metadata("node", node.as_str())
                    .with_metadata(
                        "groups",
                        failures.iter().map(|error| error.group.as_str()).collect::<Vec<_>>().join(","),
                    ),
            );
            info!(
                event_name = "extraction.validation_failed",
                correlation_id = %audit.correlation_id,
                session_id = %session.id,
                node = %node,
                "extracted values failed validation"
            );
            let prompt =
                failures.iter().map(ValidationError::user_guidance).collect::<Vec<_>>().join("\n");
            return Ok(NodeOutcome::Suspend { delta, prompt });
        }

        delta.done.insert(kind, true);
        let mut message = Some(result.message).filter(|text| !text.is_empty());
        match node {
            NodeId::Classify => {
                let branch = delta
                    .commits
                    .get(&GroupKey::Flow)
                    .and_then(|record| record.get_str("flow"))
                    .and_then(FlowBranch::parse)
                    .ok_or_else(|| NodeFailure::Corrupt("validated flow has no branch".to_owned()))?;
                delta.flow = Some(branch);
                // The general branch answers in its own node.
                if branch == FlowBranch::General {
                    message = None;
                }
            }
            NodeId::Confirm => {
                let confirmed = delta
                    .commits
                    .get(&GroupKey::Confirmation)
                    .and_then(|record| record.get_bool("confirmed"));
                if confirmed == Some(false) {
                    delta.status = Some(SessionStatus::Aborted);
                    message = Some(DECLINED_MESSAGE.to_owned());
                }
            }
            _ => {}
        }
        Ok(NodeOutcome::Continue { delta, message })
    }

    async fn general(&self, session: &Session) -> Result<NodeOutcome, NodeFailure> {
        let answer = self.adapter.complete(&session.history, GENERAL_INSTRUCTION).await?;
        Ok(NodeOutcome::Continue {
            delta: StateDelta { extraction_succeeded: true, ..StateDelta::default() },
            message: Some(answer.trim().to_owned()),
        })
    }

    /// One schedule lookup per direction still missing a schedule. A lookup that finds no
    /// matching flight re-opens that direction so the customer can correct it.
    async fn schedule_call(
        &self,
        session: &Session,
        audit: &AuditContext,
    ) -> Result<NodeOutcome, NodeFailure> {
        let product = require_product(session)?;
        let mut delta = StateDelta::default();
        let mut messages = Vec::new();

        for direction in product.directions() {
            if session.schedules.contains_key(direction) {
                continue;
            }
            let group = direction.group();
            let query = session
                .committed(group)
                .and_then(|record| FlightDetails::from_record(*direction, record))
                .ok_or_else(|| NodeFailure::Corrupt(format!("no committed `{group}` itinerary")))?;

            let outcome =
                self.gateway.get_schedule(session, &query, session.revision(group), audit).await?;
            delta.ledger.push(outcome.entry);
            match outcome.value.into_iter().next() {
                Some(schedule) => {
                    delta.schedules.insert(*direction, schedule);
                }
                None => {
                    delta.reopen.push(group);
                    messages.push(format!(
                        "I couldn't find flight {} on {} at {}. Could you double-check your {} \
                         flight details?",
                        query.flight_id,
                        query.travel_date,
                        query.airport_id,
                        direction.label()
                    ));
                }
            }
        }

        let message = (!messages.is_empty()).then(|| messages.join("\n"));
        Ok(NodeOutcome::Continue { delta, message })
    }

    async fn reserve(&self, session: &Session, audit: &AuditContext) -> Result<NodeOutcome, NodeFailure> {
        let product = require_product(session)?;
        let tickets = session
            .committed(GroupKey::Tickets)
            .and_then(TicketCounts::from_record)
            .ok_or_else(|| NodeFailure::Corrupt("no committed ticket counts".to_owned()))?;
        let mut request = ReserveRequest {
            product,
            arrival_schedule_id: 0,
            departure_schedule_id: 0,
            tickets,
        };
        for direction in product.directions() {
            let schedule = session.schedules.get(direction).ok_or_else(|| {
                NodeFailure::Corrupt(format!("no schedule for direction {direction}"))
            })?;
            match direction {
                Direction::Arrival => request.arrival_schedule_id = schedule.schedule_id,
                Direction::Departure => request.departure_schedule_id = schedule.schedule_id,
            }
        }

        let outcome = self.gateway.reserve_cart(session, &request, audit).await?;
        let message = format!(
            "I've reserved your {} for {} guest(s).",
            product.describe(),
            tickets.total()
        );
        let delta = StateDelta {
            reservation: Some(outcome.value),
            ledger: vec![outcome.entry],
            ..StateDelta::default()
        };
        Ok(NodeOutcome::Continue { delta, message: Some(message) })
    }

    async fn set_contact(
        &self,
        session: &Session,
        audit: &AuditContext,
    ) -> Result<NodeOutcome, NodeFailure> {
        let reservation = session
            .reservation
            .as_ref()
            .ok_or_else(|| NodeFailure::Corrupt("contact step reached without a reservation".to_owned()))?;
        let contact = session
            .committed(GroupKey::Contact)
            .and_then(ContactDetails::from_record)
            .ok_or_else(|| NodeFailure::Corrupt("no committed contact details".to_owned()))?;

        let request = ContactRequest { cart_item_id: reservation.cart_item_id, contact };
        let outcome = self.gateway.set_contact(session, &request, audit).await?;
        let delta = StateDelta {
            contact_receipt: Some(outcome.value),
            ledger: vec![outcome.entry],
            ..StateDelta::default()
        };
        Ok(NodeOutcome::Continue {
            delta,
            message: Some("Thanks, I've saved the lead passenger's contact details.".to_owned()),
        })
    }

    async fn make_payment(
        &self,
        session: &Session,
        audit: &AuditContext,
    ) -> Result<NodeOutcome, NodeFailure> {
        let reservation = session
            .reservation
            .as_ref()
            .ok_or_else(|| NodeFailure::Corrupt("payment step reached without a reservation".to_owned()))?;
        let payment = session
            .committed(GroupKey::Payment)
            .and_then(PaymentDetails::from_record)
            .ok_or_else(|| NodeFailure::Corrupt("no committed payment details".to_owned()))?;

        let masked = payment.masked_number();
        let request = PaymentRequest { cart_item_id: reservation.cart_item_id, payment };
        let outcome = self.gateway.make_payment(session, &request, audit).await?;
        let message = format!(
            "Payment received from card {masked}. Your reference is {}.",
            outcome.value.transaction_id
        );
        let delta = StateDelta {
            payment_receipt: Some(outcome.value),
            ledger: vec![outcome.entry],
            ..StateDelta::default()
        };
        Ok(NodeOutcome::Continue { delta, message: Some(message) })
    }
}

fn end(session: &Session) -> NodeOutcome {
    let mut delta = StateDelta::default();
    let mut message = None;
    if session.status == SessionStatus::Active {
        delta.status = Some(SessionStatus::Completed);
        if session.flow == Some(FlowBranch::Booking) && !session.is_declined() {
            message = Some(COMPLETED_MESSAGE.to_owned());
        }
    }
    NodeOutcome::Continue { delta, message }
}

fn flow_kind(node: NodeId, session: &Session) -> Result<FlowKind, NodeFailure> {
    Ok(match node {
        NodeId::Classify => FlowKind::Intent,
        NodeId::ProductType => FlowKind::Product,
        NodeId::InfoCollector(_) => FlowKind::itinerary_for(require_product(session)?),
        NodeId::ContactInfo => FlowKind::Contact,
        NodeId::Payment => FlowKind::Payment,
        NodeId::Confirm => FlowKind::Confirmation,
        other => {
            return Err(NodeFailure::Corrupt(format!("node `{other}` does not collect slots")))
        }
    })
}

/// Groups the node must complete before it can continue.
fn pending_groups(node: NodeId, schema: &FlowSchema, session: &Session) -> Vec<GroupKey> {
    match node {
        NodeId::InfoCollector(direction) => [direction.group(), GroupKey::Tickets]
            .into_iter()
            .filter(|group| schema.declares(*group) && !session.is_committed(*group))
            .collect(),
        _ => schema.required_groups().filter(|group| !session.is_committed(*group)).collect(),
    }
}

fn merged_candidate(
    session: &Session,
    fresh: &BTreeMap<GroupKey, SlotRecord>,
    group: GroupKey,
) -> SlotRecord {
    let draft = session.draft(group).cloned().unwrap_or_default();
    match fresh.get(&group) {
        Some(newer) => draft.merged_with(newer),
        None => draft,
    }
}

fn require_product(session: &Session) -> Result<ProductKind, NodeFailure> {
    session
        .product()
        .ok_or_else(|| NodeFailure::Corrupt("booking step reached without a product".to_owned()))
}

/// Card values are masked before they are echoed back to the model.
fn redacted(group: GroupKey, record: &SlotRecord) -> SlotRecord {
    if group != GroupKey::Payment {
        return record.clone();
    }
    record
        .iter()
        .map(|(name, value)| {
            let shown: Value = match (name.as_str(), value.as_str()) {
                ("cardNumber", Some(number)) => mask_card_number(number).into(),
                ("cvv", _) => "***".into(),
                _ => value.clone(),
            };
            (name.clone(), shown)
        })
        .collect()
}

/// Plain-text recap shown before confirmation.
pub fn booking_summary(session: &Session, collect_payment: bool) -> String {
    let mut lines = vec!["Here is your booking:".to_owned()];
    if let Some(product) = session.product() {
        lines.push(format!("- Product: {}", product.describe()));
        for direction in product.directions() {
            if let Some(flight) =
                session.committed(direction.group()).and_then(|record| FlightDetails::from_record(*direction, record))
            {
                lines.push(format!(
                    "- {} flight {} on {} at {}",
                    capitalize(direction.label()),
                    flight.flight_id,
                    format_date(&flight.travel_date),
                    flight.airport_id
                ));
            }
        }
    }
    if let Some(tickets) = session.committed(GroupKey::Tickets).and_then(TicketCounts::from_record) {
        lines.push(format!("- Guests: {} adult(s), {} child(ren)", tickets.adults, tickets.children));
    }
    if let Some(contact) = session.committed(GroupKey::Contact).and_then(ContactDetails::from_record) {
        lines.push(format!(
            "- Lead passenger: {} {} {} ({}, {})",
            contact.title, contact.first_name, contact.last_name, contact.email, contact.phone
        ));
    }
    if collect_payment {
        if let Some(payment) = session.committed(GroupKey::Payment).and_then(PaymentDetails::from_record) {
            lines.push(format!("- Card: {} {}", payment.card_type, payment.masked_number()));
        }
    }
    lines.join("\n")
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn format_date(raw: &str) -> String {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .map(|date| date.format("%-d %B %Y").to_string())
        .unwrap_or_else(|_| raw.to_owned())
}

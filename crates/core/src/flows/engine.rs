use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use crate::config::ConfigError;
use crate::domain::booking::Direction;
use crate::domain::session::{FlowBranch, Session};
use crate::domain::slots::GroupKey;
use crate::flows::states::{Cursor, NodeId, TransitionOutcome};
use crate::slots::{FlowKind, SlotSchemaRegistry};

/// A conversation graph: which nodes exist, where a session enters, and the conditional
/// edges between nodes. Edges are pure functions of the session.
pub trait FlowDefinition {
    fn name(&self) -> &'static str;
    fn contains(&self, node: NodeId) -> bool;
    fn entry(&self, session: &Session) -> NodeId;
    fn route(&self, from: NodeId, session: &Session) -> Result<NodeId, FlowError>;
    /// Slot schemas the graph's collector nodes rely on.
    fn flow_kinds(&self) -> Vec<FlowKind>;
}

/// The lounge booking graph.
#[derive(Clone, Debug)]
pub struct BookingGraph {
    collect_payment: bool,
}

impl BookingGraph {
    pub fn new(collect_payment: bool) -> Self {
        Self { collect_payment }
    }

    pub fn collects_payment(&self) -> bool {
        self.collect_payment
    }

    /// First booking requirement the session has not met yet.
    pub fn next_unmet(&self, session: &Session) -> NodeId {
        let Some(product) = session.product() else {
            return NodeId::ProductType;
        };
        let directions = product.directions();
        let first_direction = directions.first().copied().unwrap_or(Direction::Arrival);

        if let Some(direction) =
            directions.iter().find(|direction| !session.is_committed(direction.group()))
        {
            return NodeId::InfoCollector(*direction);
        }
        if !session.is_committed(GroupKey::Tickets)
            || !session.is_done(FlowKind::itinerary_for(product))
        {
            return NodeId::InfoCollector(first_direction);
        }
        if directions.iter().any(|direction| !session.schedules.contains_key(direction)) {
            return NodeId::ScheduleCall;
        }
        if session.reservation.is_none() {
            return NodeId::Reserve;
        }
        if !session.is_committed(GroupKey::Contact) {
            return NodeId::ContactInfo;
        }
        if session.contact_receipt.is_none() {
            return NodeId::SetContact;
        }
        if self.collect_payment && !session.is_committed(GroupKey::Payment) {
            return NodeId::Payment;
        }
        match session.confirmation() {
            None => return NodeId::Confirm,
            Some(false) => return NodeId::End,
            Some(true) => {}
        }
        if self.collect_payment && session.payment_receipt.is_none() {
            return NodeId::MakePayment;
        }
        NodeId::End
    }
}

impl Default for BookingGraph {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FlowDefinition for BookingGraph {
    fn name(&self) -> &'static str {
        "lounge_booking"
    }

    fn contains(&self, node: NodeId) -> bool {
        match node {
            NodeId::Payment | NodeId::MakePayment => self.collect_payment,
            _ => true,
        }
    }

    fn entry(&self, session: &Session) -> NodeId {
        match session.flow {
            None => NodeId::Classify,
            Some(FlowBranch::General) => NodeId::General,
            Some(FlowBranch::Booking) => self.next_unmet(session),
        }
    }

    fn route(&self, from: NodeId, session: &Session) -> Result<NodeId, FlowError> {
        if !self.contains(from) {
            return Err(FlowError::NotInGraph(from));
        }
        let to = match from {
            NodeId::End => NodeId::End,
            NodeId::Classify => self.entry(session),
            NodeId::General => NodeId::End,
            booking_node => {
                if session.flow != Some(FlowBranch::Booking) {
                    return Err(FlowError::BranchMismatch { node: booking_node });
                }
                self.next_unmet(session)
            }
        };
        Ok(to)
    }

    fn flow_kinds(&self) -> Vec<FlowKind> {
        let mut kinds = vec![
            FlowKind::Intent,
            FlowKind::Product,
            FlowKind::ArrivalItinerary,
            FlowKind::DepartureItinerary,
            FlowKind::BundleItinerary,
            FlowKind::Contact,
        ];
        if self.collect_payment {
            kinds.push(FlowKind::Payment);
        }
        kinds.push(FlowKind::Confirmation);
        kinds
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    /// Fails when the graph needs a slot schema the registry does not declare.
    pub fn validate(&self, registry: &SlotSchemaRegistry) -> Result<(), ConfigError> {
        for kind in self.flow.flow_kinds() {
            registry.describe(kind)?;
        }
        Ok(())
    }

    /// Upper bound on nodes executed in one turn.
    pub fn max_hops(&self) -> usize {
        NodeId::ALL.len() + 1
    }

    /// Node to run for the session's persisted cursor.
    pub fn resume_point(&self, session: &Session) -> Result<NodeId, FlowError> {
        match session.current_node.resolve()? {
            Cursor::Start => Ok(self.flow.entry(session)),
            Cursor::At(node) if self.flow.contains(node) => Ok(node),
            Cursor::At(node) => Err(FlowError::NotInGraph(node)),
        }
    }

    pub fn apply(&self, from: NodeId, session: &Session) -> Result<TransitionOutcome, FlowError> {
        let to = self.flow.route(from, session)?;
        Ok(TransitionOutcome { from, to })
    }

    pub fn apply_with_audit<S>(
        &self,
        from: NodeId,
        session: &Session,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(from, session);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    audit
                        .event("flow.transition_applied", AuditCategory::Flow, AuditOutcome::Success)
                        .with_metadata("from", outcome.from.as_str())
                        .with_metadata("to", outcome.to.as_str()),
                );
            }
            Err(error) => {
                sink.emit(
                    audit
                        .event("flow.transition_rejected", AuditCategory::Flow, AuditOutcome::Rejected)
                        .with_metadata("from", from.as_str())
                        .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<BookingGraph> {
    fn default() -> Self {
        Self::new(BookingGraph::default())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("session cursor `{0}` does not name a known node")]
    UnknownNode(String),
    #[error("node `{0}` is not part of the active graph")]
    NotInGraph(NodeId),
    #[error("booking node `{node}` reached outside the booking branch")]
    BranchMismatch { node: NodeId },
    #[error("turn exceeded {limit} node executions")]
    HopLimitExceeded { limit: usize },
}

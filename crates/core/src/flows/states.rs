use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::booking::{
    ContactReceipt, Direction, FlightSchedule, PaymentReceipt, Reservation,
};
use crate::domain::session::{FlowBranch, SessionStatus};
use crate::domain::slots::{GroupKey, SlotRecord};
use crate::flows::engine::FlowError;
use crate::ledger::LedgerEntry;
use crate::slots::FlowKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Classify,
    General,
    ProductType,
    InfoCollector(Direction),
    ScheduleCall,
    Reserve,
    ContactInfo,
    SetContact,
    Payment,
    Confirm,
    MakePayment,
    End,
}

/// How a node interacts with the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Consumes the user's message; only ever runs first in a turn.
    Prompting,
    /// Runs without user input and chains within a turn.
    Automatic,
    Terminal,
}

impl NodeId {
    pub const ALL: [NodeId; 13] = [
        Self::Classify,
        Self::General,
        Self::ProductType,
        Self::InfoCollector(Direction::Arrival),
        Self::InfoCollector(Direction::Departure),
        Self::ScheduleCall,
        Self::Reserve,
        Self::ContactInfo,
        Self::SetContact,
        Self::Payment,
        Self::Confirm,
        Self::MakePayment,
        Self::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::General => "general",
            Self::ProductType => "productType",
            Self::InfoCollector(Direction::Arrival) => "infoCollector.A",
            Self::InfoCollector(Direction::Departure) => "infoCollector.D",
            Self::ScheduleCall => "scheduleCall",
            Self::Reserve => "reserve",
            Self::ContactInfo => "contactInfo",
            Self::SetContact => "setContact",
            Self::Payment => "payment",
            Self::Confirm => "confirm",
            Self::MakePayment => "makePayment",
            Self::End => "end",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|node| node.as_str() == value)
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Classify
            | Self::ProductType
            | Self::InfoCollector(_)
            | Self::ContactInfo
            | Self::Payment
            | Self::Confirm => NodeKind::Prompting,
            Self::General
            | Self::ScheduleCall
            | Self::Reserve
            | Self::SetContact
            | Self::MakePayment => NodeKind::Automatic,
            Self::End => NodeKind::Terminal,
        }
    }

    pub fn is_prompting(&self) -> bool {
        self.kind() == NodeKind::Prompting
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted resume pointer. Stored as a raw string so an unknown id survives decoding and is
/// reported when the session is resumed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRef(pub String);

impl NodeRef {
    pub const START: &'static str = "__start__";

    pub fn start() -> Self {
        Self(Self::START.to_owned())
    }

    pub fn of(node: NodeId) -> Self {
        Self(node.as_str().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolve(&self) -> Result<Cursor, FlowError> {
        if self.0 == Self::START {
            return Ok(Cursor::Start);
        }
        NodeId::parse(&self.0)
            .map(Cursor::At)
            .ok_or_else(|| FlowError::UnknownNode(self.0.clone()))
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        Self::start()
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cursor {
    Start,
    At(NodeId),
}

/// Changes a node asks the engine to merge into the session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDelta {
    pub flow: Option<FlowBranch>,
    pub drafts: BTreeMap<GroupKey, SlotRecord>,
    pub commits: BTreeMap<GroupKey, SlotRecord>,
    pub reopen: Vec<GroupKey>,
    pub done: BTreeMap<FlowKind, bool>,
    pub schedules: BTreeMap<Direction, FlightSchedule>,
    pub reservation: Option<Reservation>,
    pub contact_receipt: Option<ContactReceipt>,
    pub payment_receipt: Option<PaymentReceipt>,
    pub ledger: Vec<LedgerEntry>,
    pub status: Option<SessionStatus>,
    pub extraction_succeeded: bool,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: NodeId,
    pub to: NodeId,
}

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::booking::{
    ContactReceipt, Direction, FlightSchedule, PaymentReceipt, ProductKind, Reservation,
};
use crate::domain::slots::{GroupKey, SlotRecord};
use crate::errors::DomainError;
use crate::flows::states::{NodeRef, StateDelta};
use crate::ledger::LedgerEntry;
use crate::slots::FlowKind;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Top-level conversation branch chosen by the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowBranch {
    Booking,
    General,
}

impl FlowBranch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Booking => "booking",
            Self::General => "general",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "booking" => Some(Self::Booking),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Durable per-conversation state. Everything needed to resume lives here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub current_node: NodeRef,
    pub status: SessionStatus,
    pub flow: Option<FlowBranch>,
    #[serde(default)]
    pub collected: BTreeMap<GroupKey, SlotRecord>,
    #[serde(default)]
    pub drafts: BTreeMap<GroupKey, SlotRecord>,
    #[serde(default)]
    pub revisions: BTreeMap<GroupKey, u32>,
    #[serde(default)]
    pub done: BTreeMap<FlowKind, bool>,
    #[serde(default)]
    pub schedules: BTreeMap<Direction, FlightSchedule>,
    #[serde(default)]
    pub reservation: Option<Reservation>,
    #[serde(default)]
    pub contact_receipt: Option<ContactReceipt>,
    #[serde(default)]
    pub payment_receipt: Option<PaymentReceipt>,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub side_effect_ledger: BTreeMap<String, LedgerEntry>,
    #[serde(default)]
    pub extraction_failures: u32,
    #[serde(default)]
    pub turn_count: u64,
    /// Incremented by every reset.
    #[serde(default)]
    pub epoch: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            current_node: NodeRef::start(),
            status: SessionStatus::Active,
            flow: None,
            collected: BTreeMap::new(),
            drafts: BTreeMap::new(),
            revisions: BTreeMap::new(),
            done: BTreeMap::new(),
            schedules: BTreeMap::new(),
            reservation: None,
            contact_receipt: None,
            payment_receipt: None,
            history: Vec::new(),
            side_effect_ledger: BTreeMap::new(),
            extraction_failures: 0,
            turn_count: 0,
            epoch: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_committed(&self, group: GroupKey) -> bool {
        self.collected.contains_key(&group)
    }

    pub fn committed(&self, group: GroupKey) -> Option<&SlotRecord> {
        self.collected.get(&group)
    }

    pub fn draft(&self, group: GroupKey) -> Option<&SlotRecord> {
        self.drafts.get(&group)
    }

    pub fn revision(&self, group: GroupKey) -> u32 {
        self.revisions.get(&group).copied().unwrap_or(0)
    }

    pub fn is_done(&self, kind: FlowKind) -> bool {
        self.done.get(&kind).copied().unwrap_or(false)
    }

    pub fn product(&self) -> Option<ProductKind> {
        self.committed(GroupKey::Product)
            .and_then(|record| record.get_str("productid"))
            .and_then(ProductKind::parse)
    }

    /// `Some(false)` once the customer has declined the booking summary.
    pub fn confirmation(&self) -> Option<bool> {
        self.committed(GroupKey::Confirmation).and_then(|record| record.get_bool("confirmed"))
    }

    pub fn is_declined(&self) -> bool {
        self.confirmation() == Some(false)
    }

    /// Merges a node's delta. Committed groups and the chosen flow branch are immutable;
    /// only an explicit reopen may move a committed group back to drafting.
    /// The merge is all-or-nothing: on error the session is left untouched.
    pub fn apply(&mut self, delta: StateDelta) -> Result<(), DomainError> {
        let mut next = self.clone();
        next.merge(delta)?;
        *self = next;
        Ok(())
    }

    fn merge(&mut self, delta: StateDelta) -> Result<(), DomainError> {
        if let Some(flow) = delta.flow {
            match self.flow {
                Some(current) if current != flow => {
                    return Err(DomainError::FlowImmutable { current, requested: flow });
                }
                _ => self.flow = Some(flow),
            }
        }

        for group in &delta.reopen {
            self.reopen(*group);
        }

        for (group, draft) in delta.drafts {
            if self.is_committed(group) {
                return Err(DomainError::CommittedGroupOverwrite { group });
            }
            let merged = match self.drafts.get(&group) {
                Some(existing) => existing.merged_with(&draft),
                None => draft,
            };
            self.drafts.insert(group, merged);
        }

        for (group, record) in delta.commits {
            match self.collected.get(&group) {
                Some(existing) if existing != &record => {
                    return Err(DomainError::CommittedGroupOverwrite { group });
                }
                Some(_) => {}
                None => {
                    self.drafts.remove(&group);
                    self.collected.insert(group, record);
                }
            }
        }

        for (kind, done) in delta.done {
            self.done.insert(kind, done);
        }
        for (direction, schedule) in delta.schedules {
            self.schedules.insert(direction, schedule);
        }
        if let Some(reservation) = delta.reservation {
            self.reservation = Some(reservation);
        }
        if let Some(receipt) = delta.contact_receipt {
            self.contact_receipt = Some(receipt);
        }
        if let Some(receipt) = delta.payment_receipt {
            self.payment_receipt = Some(receipt);
        }
        for entry in delta.ledger {
            self.side_effect_ledger.insert(entry.operation_key.0.clone(), entry);
        }
        if delta.extraction_succeeded {
            self.extraction_failures = 0;
        }
        if let Some(status) = delta.status {
            self.status = status;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves a committed group back into drafting and bumps its revision so follow-up
    /// side effects get a fresh operation key.
    fn reopen(&mut self, group: GroupKey) {
        if let Some(record) = self.collected.remove(&group) {
            self.drafts.insert(group, record);
        }
        *self.revisions.entry(group).or_insert(0) += 1;
        if let Some(direction) = itinerary_direction(group) {
            self.schedules.remove(&direction);
        }
        self.done.retain(|kind, _| !kind.is_itinerary());
    }

    /// Clears booking progress but keeps the transcript and side-effect ledger. The epoch
    /// moves forward so a fresh booking never collides with recorded operation keys.
    pub fn reset(&mut self) {
        let history = std::mem::take(&mut self.history);
        let ledger = std::mem::take(&mut self.side_effect_ledger);
        let created_at = self.created_at;
        let turn_count = self.turn_count;
        let epoch = self.epoch.saturating_add(1);
        *self = Session::new(self.id.clone());
        self.history = history;
        self.side_effect_ledger = ledger;
        self.created_at = created_at;
        self.turn_count = turn_count;
        self.epoch = epoch;
    }

    pub fn abort(&mut self) {
        self.status = SessionStatus::Aborted;
        self.updated_at = Utc::now();
    }

    pub fn record_user(&mut self, text: impl Into<String>) {
        self.history.push(ChatMessage::user(text));
    }

    pub fn record_assistant(&mut self, text: impl Into<String>) {
        self.history.push(ChatMessage::assistant(text));
    }
}

fn itinerary_direction(group: GroupKey) -> Option<Direction> {
    match group {
        GroupKey::Arrival => Some(Direction::Arrival),
        GroupKey::Departure => Some(Direction::Departure),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{FlowBranch, Session, SessionId, SessionStatus};
    use crate::domain::slots::{GroupKey, SlotRecord};
    use crate::errors::DomainError;
    use crate::flows::states::{NodeId, NodeRef, StateDelta};
    use crate::slots::FlowKind;

    fn arrival() -> SlotRecord {
        SlotRecord::new()
            .with("airportid", "SIA")
            .with("traveldate", "20261201")
            .with("flightId", "AA123")
    }

    #[test]
    fn flow_branch_cannot_change_once_chosen() {
        let mut session = Session::new(SessionId::from("s-1"));
        session
            .apply(StateDelta { flow: Some(FlowBranch::Booking), ..StateDelta::default() })
            .expect("first choice");

        let error = session
            .apply(StateDelta { flow: Some(FlowBranch::General), ..StateDelta::default() })
            .expect_err("flow is immutable");
        assert!(matches!(error, DomainError::FlowImmutable { .. }));
        assert_eq!(session.flow, Some(FlowBranch::Booking));
    }

    #[test]
    fn committed_group_rejects_different_values() {
        let mut session = Session::new(SessionId::from("s-2"));
        let mut delta = StateDelta::default();
        delta.commits.insert(GroupKey::Arrival, arrival());
        session.apply(delta).expect("commit");

        let mut overwrite = StateDelta::default();
        overwrite.commits.insert(GroupKey::Arrival, arrival().with("flightId", "BB999"));
        let error = session.apply(overwrite).expect_err("no silent overwrite");
        assert_eq!(error, DomainError::CommittedGroupOverwrite { group: GroupKey::Arrival });
        assert_eq!(
            session.committed(GroupKey::Arrival).and_then(|r| r.get_str("flightId")),
            Some("AA123")
        );
    }

    #[test]
    fn drafts_accumulate_until_commit() {
        let mut session = Session::new(SessionId::from("s-3"));
        let mut first = StateDelta::default();
        first.drafts.insert(GroupKey::Contact, SlotRecord::new().with("firstname", "Ada"));
        session.apply(first).expect("draft one");
        let mut second = StateDelta::default();
        second.drafts.insert(GroupKey::Contact, SlotRecord::new().with("lastname", "Lovelace"));
        session.apply(second).expect("draft two");

        let draft = session.draft(GroupKey::Contact).expect("draft present");
        assert_eq!(draft.get_str("firstname"), Some("Ada"));
        assert_eq!(draft.get_str("lastname"), Some("Lovelace"));
        assert!(!session.is_committed(GroupKey::Contact));
    }

    #[test]
    fn reopen_moves_group_back_to_drafts_and_bumps_revision() {
        let mut session = Session::new(SessionId::from("s-4"));
        let mut commit = StateDelta::default();
        commit.commits.insert(GroupKey::Departure, arrival());
        commit.done.insert(FlowKind::DepartureItinerary, true);
        session.apply(commit).expect("commit");

        session
            .apply(StateDelta { reopen: vec![GroupKey::Departure], ..StateDelta::default() })
            .expect("reopen");

        assert!(!session.is_committed(GroupKey::Departure));
        assert!(session.draft(GroupKey::Departure).is_some());
        assert_eq!(session.revision(GroupKey::Departure), 1);
        assert!(!session.is_done(FlowKind::DepartureItinerary));
    }

    #[test]
    fn reset_keeps_history_and_ledger_but_clears_progress() {
        let mut session = Session::new(SessionId::from("s-5"));
        session.record_user("hello");
        session.current_node = NodeRef::of(NodeId::Reserve);
        session.flow = Some(FlowBranch::Booking);
        session.abort();

        session.reset();

        assert_eq!(session.history.len(), 1);
        assert_eq!(session.current_node, NodeRef::start());
        assert_eq!(session.flow, None);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.epoch, 1);
    }
}

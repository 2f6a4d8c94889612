//! Side-effect ledger.
//!
//! Every irreversible upstream call is keyed by `{session}:{operation}` and recorded here before
//! its result is handed back to the workflow. A completed entry is replayed instead of calling
//! upstream again; a completed entry whose payload hash differs is an inconsistency.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::domain::booking::Direction;
use crate::domain::session::SessionId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationKey(pub String);

impl OperationKey {
    pub fn new(session_id: &SessionId, kind: &OperationKind, epoch: u32) -> Self {
        Self(format!("{}:{}", session_id, kind.key(epoch)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    GetSchedule { direction: Direction, revision: u32 },
    ReserveCart,
    SetContact,
    MakePayment,
}

impl OperationKind {
    /// Stable key fragment. Sessions that were reset carry their epoch as a suffix.
    pub fn key(&self, epoch: u32) -> String {
        let base = match self {
            Self::GetSchedule { direction, revision } => {
                format!("get_schedule.{}.r{revision}", direction.code())
            }
            Self::ReserveCart => "reserve_cart".to_owned(),
            Self::SetContact => "set_contact".to_owned(),
            Self::MakePayment => "make_payment".to_owned(),
        };
        if epoch == 0 {
            base
        } else {
            format!("{base}.e{epoch}")
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetSchedule { .. } => "get_schedule",
            Self::ReserveCart => "reserve_cart",
            Self::SetContact => "set_contact",
            Self::MakePayment => "make_payment",
        }
    }

    /// Reads may be retried after an interrupted call; writes may not.
    pub fn is_irreversible(&self) -> bool {
        !matches!(self, Self::GetSchedule { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    InFlight,
    Completed,
    FailedRetryable,
}

impl LedgerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Completed => "completed",
            Self::FailedRetryable => "failed_retryable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_flight" => Some(Self::InFlight),
            "completed" => Some(Self::Completed),
            "failed_retryable" => Some(Self::FailedRetryable),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub operation_key: OperationKey,
    pub session_id: SessionId,
    pub operation_kind: String,
    pub payload_hash: String,
    pub state: LedgerState,
    pub attempt_count: u32,
    pub result_snapshot: Option<Value>,
    pub error_snapshot: Option<String>,
    pub correlation_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn in_flight(
        operation_key: OperationKey,
        session_id: SessionId,
        operation_kind: impl Into<String>,
        payload_hash: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation_key,
            session_id,
            operation_kind: operation_kind.into(),
            payload_hash: payload_hash.into(),
            state: LedgerState::InFlight,
            attempt_count: 1,
            result_snapshot: None,
            error_snapshot: None,
            correlation_id: correlation_id.into(),
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Starts another attempt on top of a failed entry.
    pub fn retried(mut self, payload_hash: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        self.payload_hash = payload_hash.into();
        self.correlation_id = correlation_id.into();
        self.state = LedgerState::InFlight;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.error_snapshot = None;
        self.last_seen_at = Utc::now();
        self
    }

    pub fn completed(mut self, result: Value) -> Self {
        self.state = LedgerState::Completed;
        self.result_snapshot = Some(result);
        self.error_snapshot = None;
        self.last_seen_at = Utc::now();
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.state = LedgerState::FailedRetryable;
        self.result_snapshot = None;
        self.error_snapshot = Some(error.into());
        self.last_seen_at = Utc::now();
        self
    }

    pub fn is_completed(&self) -> bool {
        self.state == LedgerState::Completed
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger storage failure: {0}")]
    Storage(String),
    #[error("ledger serialization failure: {0}")]
    Serialization(String),
    #[error("ledger entry `{key}` is inconsistent: {reason}")]
    Inconsistent { key: String, reason: String },
}

/// SHA-256 of the canonical JSON encoding of a request payload.
pub fn payload_hash<P>(payload: &P) -> Result<String, LedgerError>
where
    P: Serialize + ?Sized,
{
    let encoded =
        serde_json::to_vec(payload).map_err(|error| LedgerError::Serialization(error.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    Ok(format!("{:x}", hasher.finalize()))
}

#[async_trait]
pub trait SideEffectLedger: Send + Sync {
    async fn find(&self, key: &OperationKey) -> Result<Option<LedgerEntry>, LedgerError>;
    /// Inserts or replaces the entry for its operation key. Must be durable on return.
    async fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;
    async fn entries_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;
}

#[derive(Clone, Default)]
pub struct InMemorySideEffectLedger {
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
}

impl InMemorySideEffectLedger {
    pub fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SideEffectLedger for InMemorySideEffectLedger {
    async fn find(&self, key: &OperationKey) -> Result<Option<LedgerEntry>, LedgerError> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(entries.get(key.as_str()).cloned())
    }

    async fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(entry.operation_key.0.clone(), entry.clone());
        Ok(())
    }

    async fn entries_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut matching: Vec<LedgerEntry> =
            entries.values().filter(|entry| &entry.session_id == session_id).cloned().collect();
        matching.sort_by(|left, right| left.first_seen_at.cmp(&right.first_seen_at));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        payload_hash, InMemorySideEffectLedger, LedgerEntry, LedgerState, OperationKey,
        OperationKind, SideEffectLedger,
    };
    use crate::domain::booking::Direction;
    use crate::domain::session::SessionId;

    #[test]
    fn operation_keys_name_session_kind_and_revision() {
        let session = SessionId::from("sess-1");
        let schedule = OperationKind::GetSchedule { direction: Direction::Departure, revision: 2 };

        assert_eq!(OperationKey::new(&session, &schedule, 0).as_str(), "sess-1:get_schedule.D.r2");
        assert_eq!(
            OperationKey::new(&session, &OperationKind::ReserveCart, 0).as_str(),
            "sess-1:reserve_cart"
        );
        assert_eq!(
            OperationKey::new(&session, &OperationKind::MakePayment, 1).as_str(),
            "sess-1:make_payment.e1"
        );
        assert!(!schedule.is_irreversible());
        assert!(OperationKind::SetContact.is_irreversible());
    }

    #[test]
    fn payload_hash_is_stable_and_sensitive_to_content() {
        let first = payload_hash(&json!({"productid": "ARRIVALONLY", "adulttickets": 2}))
            .expect("hash");
        let again = payload_hash(&json!({"productid": "ARRIVALONLY", "adulttickets": 2}))
            .expect("hash");
        let changed = payload_hash(&json!({"productid": "ARRIVALONLY", "adulttickets": 3}))
            .expect("hash");

        assert_eq!(first, again);
        assert_ne!(first, changed);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn ledger_state_round_trips_from_storage_encoding() {
        for state in [LedgerState::InFlight, LedgerState::Completed, LedgerState::FailedRetryable]
        {
            assert_eq!(LedgerState::parse(state.as_str()), Some(state));
        }
    }

    #[tokio::test]
    async fn in_memory_ledger_replaces_entries_by_key() {
        let ledger = InMemorySideEffectLedger::default();
        let session = SessionId::from("sess-2");
        let key = OperationKey::new(&session, &OperationKind::ReserveCart, 0);

        let entry = LedgerEntry::in_flight(key.clone(), session.clone(), "reserve_cart", "h1", "c1");
        ledger.record(&entry).await.expect("record in flight");
        let failed = entry.failed("timeout");
        ledger.record(&failed).await.expect("record failure");
        let retried = failed.retried("h1", "c2").completed(json!({"cartitemid": 9}));
        ledger.record(&retried).await.expect("record completion");

        let stored = ledger.find(&key).await.expect("find").expect("entry present");
        assert_eq!(stored.state, LedgerState::Completed);
        assert_eq!(stored.attempt_count, 2);
        assert_eq!(stored.result_snapshot, Some(json!({"cartitemid": 9})));
        assert_eq!(ledger.len(), 1);
        assert_eq!(
            ledger.entries_for_session(&session).await.expect("entries").len(),
            1
        );
    }
}

//! Side-effect gateway.
//!
//! The only path to the booking backend. Each call is keyed by session, operation and epoch;
//! callers are serialised per key, a completed entry is replayed from the ledger instead of
//! calling upstream again, and every outcome is recorded durably before it is returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use concierge_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use concierge_core::domain::booking::{
    ContactReceipt, FlightDetails, FlightSchedule, PaymentReceipt, Reservation,
};
use concierge_core::domain::session::Session;
use concierge_core::ledger::{
    payload_hash, LedgerEntry, LedgerError, LedgerState, OperationKey, OperationKind,
    SideEffectLedger,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::locks::KeyedLocks;
use crate::upstream::{BookingApi, ContactRequest, PaymentRequest, ReserveRequest, UpstreamError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Result of a gateway call plus the ledger entry to mirror into the session.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayOutcome<R> {
    pub value: R,
    pub entry: LedgerEntry,
    pub replayed: bool,
}

pub struct SideEffectGateway {
    api: Arc<dyn BookingApi>,
    ledger: Arc<dyn SideEffectLedger>,
    audit: Arc<dyn AuditSink>,
    locks: KeyedLocks,
    timeout: Duration,
}

impl SideEffectGateway {
    pub fn new(
        api: Arc<dyn BookingApi>,
        ledger: Arc<dyn SideEffectLedger>,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> Self {
        Self { api, ledger, audit, locks: KeyedLocks::default(), timeout }
    }

    pub async fn get_schedule(
        &self,
        session: &Session,
        query: &FlightDetails,
        revision: u32,
        audit: &AuditContext,
    ) -> Result<GatewayOutcome<Vec<FlightSchedule>>, GatewayError> {
        let kind = OperationKind::GetSchedule { direction: query.direction, revision };
        let owned = query.clone();
        self.execute(session, kind, query, audit, move |api| async move {
            api.get_schedule(&owned).await
        })
        .await
    }

    pub async fn reserve_cart(
        &self,
        session: &Session,
        request: &ReserveRequest,
        audit: &AuditContext,
    ) -> Result<GatewayOutcome<Reservation>, GatewayError> {
        let owned = request.clone();
        self.execute(session, OperationKind::ReserveCart, request, audit, move |api| async move {
            api.reserve_cart(&owned).await
        })
        .await
    }

    pub async fn set_contact(
        &self,
        session: &Session,
        request: &ContactRequest,
        audit: &AuditContext,
    ) -> Result<GatewayOutcome<ContactReceipt>, GatewayError> {
        let owned = request.clone();
        self.execute(session, OperationKind::SetContact, request, audit, move |api| async move {
            api.set_contact(&owned).await
        })
        .await
    }

    pub async fn make_payment(
        &self,
        session: &Session,
        request: &PaymentRequest,
        audit: &AuditContext,
    ) -> Result<GatewayOutcome<PaymentReceipt>, GatewayError> {
        let owned = request.clone();
        self.execute(session, OperationKind::MakePayment, request, audit, move |api| async move {
            api.make_payment(&owned).await
        })
        .await
    }

    /// The in-flight record, the upstream call and the ledger write that settles it run on their
    /// own task, holding the operation lock. Dropping the caller's future does not abandon the call: a retry waits on
    /// the lock and then sees the recorded outcome.
    async fn execute<P, R, F, Fut>(
        &self,
        session: &Session,
        kind: OperationKind,
        payload: &P,
        audit: &AuditContext,
        call: F,
    ) -> Result<GatewayOutcome<R>, GatewayError>
    where
        P: Serialize + ?Sized,
        R: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Arc<dyn BookingApi>) -> Fut,
        Fut: Future<Output = Result<R, UpstreamError>> + Send + 'static,
    {
        let key = OperationKey::new(&session.id, &kind, session.epoch);
        let hash = payload_hash(payload)?;
        let guard = self.locks.acquire(key.as_str()).await;

        let pending = match self.ledger.find(&key).await? {
            Some(entry) if entry.is_completed() => {
                let value = self.replay(&entry, &hash, audit)?;
                return Ok(GatewayOutcome { value, entry, replayed: true });
            }
            Some(entry) if entry.state == LedgerState::InFlight && kind.is_irreversible() => {
                let rejected = AuditOutcome::Rejected;
                emit(self.audit.as_ref(), audit, "side_effect.inconsistent", rejected, &key, &kind);
                return Err(LedgerError::Inconsistent {
                    key: key.to_string(),
                    reason: "an earlier attempt was interrupted and its outcome is unknown"
                        .to_owned(),
                }
                .into());
            }
            Some(entry) => entry.retried(hash, audit.correlation_id.clone()),
            None => LedgerEntry::in_flight(
                key.clone(),
                session.id.clone(),
                kind.name(),
                hash,
                audit.correlation_id.clone(),
            ),
        };
        let upstream = call(self.api.clone());
        let settlement = Settlement {
            ledger: self.ledger.clone(),
            sink: self.audit.clone(),
            audit: audit.clone(),
            key,
            kind,
            timeout: self.timeout,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            settlement.run(pending, upstream).await
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                let cause = format!("upstream task failed: {error}");
                Err(UpstreamError::new(kind.name(), cause).into())
            }
        }
    }

    fn replay<R>(&self, entry: &LedgerEntry, hash: &str, audit: &AuditContext) -> Result<R, LedgerError>
    where
        R: DeserializeOwned,
    {
        let key = &entry.operation_key;
        if entry.payload_hash != hash {
            self.audit.emit(
                audit
                    .event("side_effect.inconsistent", AuditCategory::SideEffect, AuditOutcome::Rejected)
                    .with_metadata("operation_key", key.as_str()),
            );
            return Err(LedgerError::Inconsistent {
                key: key.to_string(),
                reason: "recorded payload differs from this request".to_owned(),
            });
        }
        let snapshot = entry.result_snapshot.clone().ok_or_else(|| LedgerError::Inconsistent {
            key: key.to_string(),
            reason: "completed entry has no recorded result".to_owned(),
        })?;
        let value = serde_json::from_value(snapshot)
            .map_err(|error| LedgerError::Serialization(error.to_string()))?;
        self.audit.emit(
            audit
                .event("side_effect.replayed", AuditCategory::SideEffect, AuditOutcome::Success)
                .with_metadata("operation_key", key.as_str()),
        );
        Ok(value)
    }
}

/// Everything needed to finish an upstream call once it has been handed to its own task.
struct Settlement {
    ledger: Arc<dyn SideEffectLedger>,
    sink: Arc<dyn AuditSink>,
    audit: AuditContext,
    key: OperationKey,
    kind: OperationKind,
    timeout: Duration,
}

impl Settlement {
    async fn run<R, Fut>(
        self,
        pending: LedgerEntry,
        upstream: Fut,
    ) -> Result<GatewayOutcome<R>, GatewayError>
    where
        R: Serialize,
        Fut: Future<Output = Result<R, UpstreamError>>,
    {
        let Self { ledger, sink, audit, key, kind, timeout } = self;
        ledger.record(&pending).await?;
        emit(sink.as_ref(), &audit, "side_effect.started", AuditOutcome::Success, &key, &kind);

        let result = match tokio::time::timeout(timeout, upstream).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::new(
                kind.name(),
                format!("timed out after {}s", timeout.as_secs()),
            )),
        };

        match result {
            Ok(value) => {
                let snapshot = serde_json::to_value(&value)
                    .map_err(|error| LedgerError::Serialization(error.to_string()))?;
                let entry = pending.completed(snapshot);
                ledger.record(&entry).await?;
                info!(
                    event_name = "side_effect.completed",
                    correlation_id = %audit.correlation_id,
                    operation_key = %key,
                    attempt = entry.attempt_count,
                    "upstream call completed"
                );
                let success = AuditOutcome::Success;
                emit(sink.as_ref(), &audit, "side_effect.completed", success, &key, &kind);
                Ok(GatewayOutcome { value, entry, replayed: false })
            }
            Err(error) => {
                let entry = pending.failed(error.to_string());
                ledger.record(&entry).await?;
                warn!(
                    event_name = "side_effect.failed",
                    correlation_id = %audit.correlation_id,
                    operation_key = %key,
                    attempt = entry.attempt_count,
                    error = %error,
                    "upstream call failed"
                );
                let failed = AuditOutcome::Failed;
                emit(sink.as_ref(), &audit, "side_effect.failed", failed, &key, &kind);
                Err(error.into())
            }
        }
    }
}

fn emit(
    sink: &dyn AuditSink,
    audit: &AuditContext,
    event_type: &str,
    outcome: AuditOutcome,
    key: &OperationKey,
    kind: &OperationKind,
) {
    sink.emit(
        audit
            .event(event_type, AuditCategory::SideEffect, outcome)
            .with_metadata("operation_key", key.as_str())
            .with_metadata("operation", kind.name()),
    );
}

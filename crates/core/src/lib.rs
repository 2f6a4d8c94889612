pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod ledger;
pub mod slots;
pub mod store;

pub use audit::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink, NoopAuditSink,
    TracingAuditSink,
};
pub use domain::booking::{Direction, ProductKind};
pub use domain::session::{ChatMessage, FlowBranch, Role, Session, SessionId, SessionStatus};
pub use domain::slots::{GroupKey, SlotRecord};
pub use errors::{ApplicationError, DomainError, FailureKind, InterfaceError};
pub use flows::{BookingGraph, FlowDefinition, FlowEngine, FlowError, NodeId, NodeRef, StateDelta};
pub use ledger::{
    InMemorySideEffectLedger, LedgerEntry, LedgerError, LedgerState, OperationKey, OperationKind,
    SideEffectLedger,
};
pub use slots::{FlowKind, FlowSchema, SlotSchemaRegistry, ValidationError};
pub use store::{InMemorySessionStore, SessionStore, StoreError};

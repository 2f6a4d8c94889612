//! Turn runtime.
//!
//! `process_turn` loads the session, re-enters the node recorded as its continuation point,
//! follows automatic hand-offs until a node suspends or the graph ends, and persists the
//! session once the turn is settled. Turns for one session are strictly sequential.

use std::sync::Arc;
use std::time::Duration;

use concierge_core::audit::{
    AuditCategory, AuditContext, AuditOutcome, AuditSink, NoopAuditSink,
};
use concierge_core::config::{AppConfig, BookingApiMode, ConfigError, EngineConfig};
use concierge_core::domain::session::{Session, SessionId, SessionStatus};
use concierge_core::errors::{ApplicationError, FailureKind};
use concierge_core::flows::{BookingGraph, FlowEngine, FlowError, NodeId, NodeRef};
use concierge_core::ledger::SideEffectLedger;
use concierge_core::slots::SlotSchemaRegistry;
use concierge_core::store::{SessionStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::extraction::ExtractionAdapter;
use crate::gateway::SideEffectGateway;
use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::llm::{LlmClient, OpenAiCompatibleClient};
use crate::locks::KeyedLocks;
use crate::nodes::{NodeExecutor, NodeFailure, NodeOutcome};
use crate::sandbox::SandboxBookingApi;
use crate::upstream::{BookingApi, HttpBookingApi};

const CLOSED_SESSION_MESSAGE: &str =
    "This conversation has ended. Please start a new session to make another booking.";

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("runtime is missing its {0}")]
    Incomplete(&'static str),
    #[error("client setup failed: {0}")]
    Client(String),
}

impl From<RuntimeError> for ApplicationError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Store(error) => Self::Persistence(error.to_string()),
            RuntimeError::NotFound(session_id) => Self::NotFound(session_id.to_string()),
            RuntimeError::Client(message) => Self::Integration(message),
            RuntimeError::Config(error) => Self::Configuration(error.to_string()),
            RuntimeError::Incomplete(part) => Self::Configuration(format!("missing {part}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TurnReply {
    pub session_id: SessionId,
    pub assistant_text: String,
    /// The session waits for user input at `node`.
    pub is_suspended: bool,
    /// The session is completed or aborted; further turns are refused.
    pub is_terminal: bool,
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<&'static str>,
}

enum TurnEnd {
    Suspended,
    Terminal,
}

struct TurnOutcome {
    end: TurnEnd,
    messages: Vec<String>,
    failure: Option<FailureKind>,
}

pub struct BookingRuntime {
    engine: FlowEngine<BookingGraph>,
    executor: NodeExecutor,
    store: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    guardrails: GuardrailPolicy,
    session_locks: KeyedLocks,
}

impl BookingRuntime {
    pub async fn process_turn(
        &self,
        session_id: &SessionId,
        user_text: &str,
    ) -> Result<TurnReply, RuntimeError> {
        let correlation_id = Uuid::new_v4().to_string();
        let audit = AuditContext::new(Some(session_id.clone()), correlation_id.clone(), "runtime");
        let _guard = self.session_locks.acquire(session_id.as_str()).await;

        let mut session = match self.store.load(session_id).await? {
            Some(session) => session,
            None => {
                info!(
                    event_name = "session.created",
                    correlation_id = %correlation_id,
                    session_id = %session_id,
                    "starting new session"
                );
                Session::new(session_id.clone())
            }
        };

        if session.status.is_terminal() {
            return Ok(TurnReply {
                session_id: session.id.clone(),
                assistant_text: CLOSED_SESSION_MESSAGE.to_owned(),
                is_suspended: false,
                is_terminal: true,
                node: session.current_node.to_string(),
                failure: None,
            });
        }

        session.record_user(user_text);
        session.turn_count += 1;
        self.audit.emit(
            audit
                .event("ingress.turn_received", AuditCategory::Ingress, AuditOutcome::Success)
                .with_metadata("node", session.current_node.as_str()),
        );

        let outcome = self.drive(&mut session, &audit).await;
        let assistant_text = outcome.messages.join("\n");
        if !assistant_text.is_empty() {
            session.record_assistant(assistant_text.clone());
        }

        self.store.save(&session).await?;
        self.audit.emit(
            audit
                .event("persistence.session_saved", AuditCategory::Persistence, AuditOutcome::Success)
                .with_metadata("node", session.current_node.as_str())
                .with_metadata("status", session.status.as_str()),
        );

        info!(
            event_name = "runtime.turn.completed",
            correlation_id = %correlation_id,
            session_id = %session.id,
            node = %session.current_node,
            status = session.status.as_str(),
            "turn processed"
        );

        Ok(TurnReply {
            session_id: session.id.clone(),
            assistant_text,
            is_suspended: matches!(outcome.end, TurnEnd::Suspended),
            is_terminal: session.status.is_terminal(),
            node: session.current_node.to_string(),
            failure: outcome.failure.map(|kind| kind.as_str()),
        })
    }

    /// Clears booking progress but keeps the transcript and side-effect history.
    pub async fn reset(&self, session_id: &SessionId) -> Result<Session, RuntimeError> {
        let _guard = self.session_locks.acquire(session_id.as_str()).await;
        let mut session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(session_id.clone()))?;
        session.reset();
        self.store.save(&session).await?;
        info!(
            event_name = "session.reset",
            session_id = %session_id,
            epoch = session.epoch,
            "session reset"
        );
        Ok(session)
    }

    /// Ends a session at the user's request.
    pub async fn abort(&self, session_id: &SessionId) -> Result<Session, RuntimeError> {
        let _guard = self.session_locks.acquire(session_id.as_str()).await;
        let mut session = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(session_id.clone()))?;
        if !session.status.is_terminal() {
            session.abort();
            self.store.save(&session).await?;
        }
        info!(event_name = "session.aborted", session_id = %session_id, "session aborted by caller");
        Ok(session)
    }

    pub async fn session(&self, session_id: &SessionId) -> Result<Option<Session>, RuntimeError> {
        Ok(self.store.load(session_id).await?)
    }

    async fn drive(&self, session: &mut Session, audit: &AuditContext) -> TurnOutcome {
        let mut messages = Vec::new();
        let mut node = match self.engine.resume_point(session) {
            Ok(node) => node,
            Err(error) => return self.corrupt(session, audit, error.to_string(), messages),
        };

        for hop in 0..self.engine.max_hops() {
            if hop > 0 && node.is_prompting() {
                session.current_node = NodeRef::of(node);
                messages.extend(self.executor.opening_prompt(node, session));
                self.suspended(session, audit, node);
                return TurnOutcome { end: TurnEnd::Suspended, messages, failure: None };
            }

            match self.executor.run(node, session, audit, self.audit.as_ref()).await {
                Ok(NodeOutcome::Suspend { delta, prompt }) => {
                    if let Err(error) = session.apply(delta) {
                        return self.corrupt(session, audit, error.to_string(), messages);
                    }
                    session.current_node = NodeRef::of(node);
                    messages.push(prompt);
                    self.suspended(session, audit, node);
                    return TurnOutcome { end: TurnEnd::Suspended, messages, failure: None };
                }
                Ok(NodeOutcome::Continue { delta, message }) => {
                    if let Err(error) = session.apply(delta) {
                        return self.corrupt(session, audit, error.to_string(), messages);
                    }
                    messages.extend(message);
                    if node == NodeId::End {
                        session.current_node = NodeRef::of(NodeId::End);
                        return TurnOutcome { end: TurnEnd::Terminal, messages, failure: None };
                    }
                    match self.engine.apply_with_audit(node, session, self.audit.as_ref(), audit) {
                        Ok(transition) => node = transition.to,
                        Err(error) => return self.corrupt(session, audit, error.to_string(), messages),
                    }
                }
                Err(failure) => return self.recover(session, audit, node, failure, messages),
            }
        }

        let error = FlowError::HopLimitExceeded { limit: self.engine.max_hops() };
        self.corrupt(session, audit, error.to_string(), messages)
    }

    fn recover(
        &self,
        session: &mut Session,
        audit: &AuditContext,
        node: NodeId,
        failure: NodeFailure,
        mut messages: Vec<String>,
    ) -> TurnOutcome {
        let kind = failure.kind();
        if kind == FailureKind::Extraction {
            session.extraction_failures = session.extraction_failures.saturating_add(1);
        }
        let decision = self.guardrails.evaluate(&failure, session.extraction_failures);
        warn!(
            event_name = "runtime.node.failed",
            correlation_id = %audit.correlation_id,
            session_id = %session.id,
            node = %node,
            failure = kind.as_str(),
            extraction_failures = session.extraction_failures,
            reason_code = decision.reason_code(),
            error = %failure,
            "node failed"
        );
        self.audit.emit(
            audit
                .event("flow.node_failed", AuditCategory::Flow, AuditOutcome::Failed)
                .with_metadata("node", node.as_str())
                .with_metadata("failure", kind.as_str())
                .with_metadata("reason_code", decision.reason_code()),
        );

        messages.push(decision.user_message().to_owned());
        match decision {
            GuardrailDecision::Reprompt { .. } => {
                session.current_node = NodeRef::of(node);
                self.suspended(session, audit, node);
                TurnOutcome { end: TurnEnd::Suspended, messages, failure: Some(kind) }
            }
            GuardrailDecision::Abort { .. } => {
                session.current_node = NodeRef::of(node);
                session.abort();
                TurnOutcome { end: TurnEnd::Terminal, messages, failure: Some(kind) }
            }
        }
    }

    /// Aborts the session without touching its cursor. Nothing is repaired automatically.
    fn corrupt(
        &self,
        session: &mut Session,
        audit: &AuditContext,
        reason: String,
        mut messages: Vec<String>,
    ) -> TurnOutcome {
        error!(
            event_name = "runtime.session.corrupt",
            correlation_id = %audit.correlation_id,
            session_id = %session.id,
            node = %session.current_node,
            reason = %reason,
            "session state is corrupt; aborting"
        );
        self.audit.emit(
            audit
                .event("flow.session_corrupt", AuditCategory::Flow, AuditOutcome::Rejected)
                .with_metadata("node", session.current_node.as_str())
                .with_metadata("reason", reason),
        );
        session.abort();
        messages.push(FailureKind::CorruptSession.user_message().to_owned());
        TurnOutcome { end: TurnEnd::Terminal, messages, failure: Some(FailureKind::CorruptSession) }
    }

    fn suspended(&self, session: &Session, audit: &AuditContext, node: NodeId) {
        self.audit.emit(
            audit
                .event("flow.turn_suspended", AuditCategory::Flow, AuditOutcome::Success)
                .with_metadata("node", node.as_str()),
        );
        info!(
            event_name = "flow.turn_suspended",
            correlation_id = %audit.correlation_id,
            session_id = %session.id,
            node = %node,
            "waiting for user input"
        );
    }
}

/// Wires a `BookingRuntime` from its collaborators.
pub struct RuntimeBuilder {
    engine: EngineConfig,
    registry: SlotSchemaRegistry,
    llm: Option<Arc<dyn LlmClient>>,
    booking_api: Option<Arc<dyn BookingApi>>,
    store: Option<Arc<dyn SessionStore>>,
    ledger: Option<Arc<dyn SideEffectLedger>>,
    audit: Arc<dyn AuditSink>,
}

impl RuntimeBuilder {
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            registry: SlotSchemaRegistry::standard(),
            llm: None,
            booking_api: None,
            store: None,
            ledger: None,
            audit: Arc::new(NoopAuditSink),
        }
    }

    /// Language model and booking backend as configured. `force_sandbox` swaps in the
    /// in-process backend regardless of `booking_api.mode`.
    pub fn from_config(config: &AppConfig, force_sandbox: bool) -> Result<Self, RuntimeError> {
        let llm = OpenAiCompatibleClient::from_config(&config.llm)
            .map_err(|error| RuntimeError::Client(error.to_string()))?;
        let booking_api: Arc<dyn BookingApi> =
            if force_sandbox || config.booking_api.mode == BookingApiMode::Sandbox {
                Arc::new(SandboxBookingApi::new())
            } else {
                Arc::new(
                    HttpBookingApi::from_config(&config.booking_api)
                        .map_err(|error| RuntimeError::Client(error.to_string()))?,
                )
            };
        Ok(Self::new(config.engine.clone()).llm(Arc::new(llm)).booking_api(booking_api))
    }

    pub fn registry(mut self, registry: SlotSchemaRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn booking_api(mut self, booking_api: Arc<dyn BookingApi>) -> Self {
        self.booking_api = Some(booking_api);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn SideEffectLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Fails when the graph needs a slot schema the registry lacks.
    pub fn build(self) -> Result<BookingRuntime, RuntimeError> {
        let llm = self.llm.ok_or(RuntimeError::Incomplete("language model client"))?;
        let booking_api = self.booking_api.ok_or(RuntimeError::Incomplete("booking api"))?;
        let store = self.store.ok_or(RuntimeError::Incomplete("session store"))?;
        let ledger = self.ledger.ok_or(RuntimeError::Incomplete("side-effect ledger"))?;

        let engine = FlowEngine::new(BookingGraph::new(self.engine.collect_payment));
        engine.validate(&self.registry)?;

        let adapter =
            ExtractionAdapter::new(llm, Duration::from_secs(self.engine.llm_timeout_secs));
        let gateway = SideEffectGateway::new(
            booking_api,
            ledger,
            self.audit.clone(),
            Duration::from_secs(self.engine.upstream_timeout_secs),
        );
        let executor =
            NodeExecutor::new(self.registry, adapter, gateway, self.engine.collect_payment);

        Ok(BookingRuntime {
            engine,
            executor,
            store,
            audit: self.audit,
            guardrails: GuardrailPolicy::new(self.engine.max_extraction_retries),
            session_locks: KeyedLocks::default(),
        })
    }
}

//! Conversation runtime for lounge bookings.
//!
//! Each user turn enters the booking graph at the session's continuation point and runs until
//! a node needs more input or the graph ends:
//! 1. **Extraction** (`extraction`) - the language model turns free text into slot candidates
//! 2. **Node execution** (`nodes`) - candidates are validated and committed, or re-asked for
//! 3. **Side effects** (`gateway`) - booking API calls go through the ledger, at most once each
//! 4. **Recovery** (`guardrails`) - failures become a re-prompt or end the session
//!
//! The language model never decides routing. It only fills slots; the graph decides what runs.

pub mod extraction;
pub mod gateway;
pub mod guardrails;
pub mod llm;
pub mod locks;
pub mod nodes;
pub mod runtime;
pub mod sandbox;
pub mod upstream;

pub use extraction::{ExtractionAdapter, ExtractionError, ExtractionResult};
pub use gateway::{GatewayError, GatewayOutcome, SideEffectGateway};
pub use guardrails::{GuardrailDecision, GuardrailPolicy};
pub use llm::{LlmClient, LlmError, OpenAiCompatibleClient};
pub use nodes::{NodeExecutor, NodeFailure, NodeOutcome};
pub use runtime::{BookingRuntime, RuntimeBuilder, RuntimeError, TurnReply};
pub use sandbox::{SandboxBookingApi, ScriptedLlm};
pub use upstream::{BookingApi, HttpBookingApi, UpstreamError};

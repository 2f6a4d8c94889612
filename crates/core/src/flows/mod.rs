pub mod engine;
pub mod states;

pub use engine::{BookingGraph, FlowDefinition, FlowEngine, FlowError};
pub use states::{Cursor, NodeId, NodeKind, NodeRef, StateDelta, TransitionOutcome};

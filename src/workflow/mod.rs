pub mod definition;
pub mod engine;

pub use definition::{
    EdgeCondition, NodeType, WorkflowDefinition, WorkflowEdge, WorkflowNode, OUTCOME_FAILURE,
    OUTCOME_SUCCESS,
};
pub use engine::{
    AdvanceOutcome, Transition, WorkflowEngine, WorkflowExecution, ESCALATION_MAX_ATTEMPTS,
    TIMEOUT_REASON,
};

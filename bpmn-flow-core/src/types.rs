use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Scalar aliases ───────────────────────────────────────────

/// A runtime variable value. The engine only interprets it for conditions
/// and loop bookkeeping; everything else is opaque payload.
pub type Value = serde_json::Value;

/// Named variables of one scope.
pub type Variables = BTreeMap<String, Value>;

/// Arena index of an execution. Never reused within one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub u32);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec-{}", self.0)
    }
}

// ─── Loop variables ───────────────────────────────────────────

/// Per-iteration index, local to the iteration execution.
pub const LOOP_COUNTER: &str = "loopCounter";
/// Total number of iterations, local to the loop scope.
pub const NR_OF_INSTANCES: &str = "nrOfInstances";
/// Iterations started but not yet completed, local to the loop scope.
pub const NR_OF_ACTIVE_INSTANCES: &str = "nrOfActiveInstances";
/// Iterations completed so far, local to the loop scope.
pub const NR_OF_COMPLETED_INSTANCES: &str = "nrOfCompletedInstances";

// ─── Execution lifecycle ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Positioned at a node; a token.
    Active,
    /// Container for child executions (sub-process, loop, fan-out).
    Scope,
    Ended,
}

/// Structural role of an execution inside its tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionRole {
    /// Root of a process instance or of a called sub-process instance.
    ProcessInstance,
    /// Child token: a fan-out branch or the body of an embedded sub-process.
    Branch,
    /// Multi-instance container holding the `nrOf*` bookkeeping.
    LoopScope,
    /// One multi-instance iteration, owning `loopCounter` and the element variable.
    LoopIteration,
    /// Scope interposed below an iteration when the looped activity is itself a scope.
    LoopBody,
}

impl ExecutionRole {
    pub fn is_loop_member(&self) -> bool {
        matches!(self, ExecutionRole::LoopIteration | ExecutionRole::LoopBody)
    }
}

/// Why an execution ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Reached a node without outgoing transitions, or all children completed.
    Completed,
    /// The node had outgoing transitions but none of their conditions held.
    NoTransitionTaken,
    /// Cancelled from outside: error propagation or early loop completion.
    Destroyed { cause: String },
    /// Torn down with the whole instance after an unhandled business error.
    Terminated { error_code: String },
}

/// Top-level state of a process instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Running,
    Completed,
    Failed { error_code: String },
}

impl ProcessState {
    /// Returns true if no further progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed { .. })
    }
}

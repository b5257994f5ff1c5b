use crate::types::*;
use serde::{Deserialize, Serialize};

/// Append-only audit trail of one execution tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuntimeEvent {
    InstanceStarted {
        instance: ExecutionId,
        process_key: String,
        /// Calling execution when this is a called sub-process instance.
        super_execution: Option<ExecutionId>,
    },
    ExecutionCreated {
        execution: ExecutionId,
        parent: Option<ExecutionId>,
        role: ExecutionRole,
    },
    NodeEntered {
        execution: ExecutionId,
        node_id: String,
    },
    TransitionTaken {
        execution: ExecutionId,
        from: String,
        to: String,
    },
    /// More than one transition was taken; the execution became a concurrent root.
    Forked {
        execution: ExecutionId,
        node_id: String,
        children: Vec<ExecutionId>,
    },
    ExecutionEnded {
        execution: ExecutionId,
        reason: EndReason,
    },
    LoopStarted {
        scope: ExecutionId,
        node_id: String,
        nr_of_instances: u64,
        sequential: bool,
    },
    LoopIterationStarted {
        execution: ExecutionId,
        node_id: String,
        loop_counter: u64,
    },
    LoopIterationCompleted {
        execution: ExecutionId,
        node_id: String,
        nr_of_completed_instances: u64,
        nr_of_active_instances: u64,
    },
    LoopCompleted {
        node_id: String,
        nr_of_instances: u64,
        nr_of_completed_instances: u64,
        /// True when the completion condition cut the loop short.
        early: bool,
    },
    SignalReceived {
        execution: ExecutionId,
        node_id: String,
        signal_name: Option<String>,
    },
    SubProcessStarted {
        caller: ExecutionId,
        sub_instance: ExecutionId,
        process_key: String,
    },
    SubProcessCompleting {
        caller: ExecutionId,
        sub_instance: ExecutionId,
    },
    SubProcessCompleted {
        caller: ExecutionId,
    },
    ErrorThrown {
        execution: ExecutionId,
        error_code: String,
    },
    ErrorCaught {
        error_code: String,
        boundary_id: String,
        handler: ExecutionId,
        destroyed: Vec<ExecutionId>,
    },
    ErrorUnhandled {
        error_code: String,
    },
    InstanceCompleted {
        instance: ExecutionId,
    },
    InstanceTerminated {
        instance: ExecutionId,
        error_code: String,
    },
}

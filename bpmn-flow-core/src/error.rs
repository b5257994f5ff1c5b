//! Error taxonomy of the execution core.
//!
//! Business errors ([`BpmnError`]) are not faults: behaviors return them inside
//! [`Outcome::BusinessError`] and the dispatcher routes them to the error
//! propagator. [`Fault`] is reserved for failures nothing inside the engine can
//! recover from.

use crate::types::ExecutionId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A business error raised by process logic, identified by its error code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("business error '{error_code}'")]
pub struct BpmnError {
    pub error_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BpmnError {
    pub fn new(error_code: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: None,
        }
    }

    pub fn with_message(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: Some(message.into()),
        }
    }
}

/// Result of running a behavior on an execution.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// Control moved on: the node was left, or the execution ended.
    Continue,
    /// The execution is parked until a signal or a sub-process completion.
    Wait,
    /// Must be routed through the error propagator, never bubbled.
    BusinessError(BpmnError),
}

impl From<BpmnError> for Outcome {
    fn from(error: BpmnError) -> Self {
        Outcome::BusinessError(error)
    }
}

/// Bad model or bad runtime data. Fatal to the current dispatch, never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("node '{node}' not found in process '{process}'")]
    UnknownNode { node: String, process: String },

    #[error("no deployed definition for process key '{0}'")]
    DefinitionNotFound(String),

    #[error("invalid process definition '{process}': {message}")]
    InvalidDefinition { process: String, message: String },

    #[error("node '{node}' is missing {what}")]
    Missing { node: String, what: &'static str },

    #[error("expression '{expression}' on node '{node}' must resolve to {expected}, got {found}")]
    UnexpectedType {
        node: String,
        expression: String,
        expected: &'static str,
        found: String,
    },

    #[error("invalid loop cardinality {value} on node '{node}'")]
    InvalidCardinality { node: String, value: String },

    #[error("expression '{expression}' on node '{node}' failed: {message}")]
    Expression {
        node: String,
        expression: String,
        message: String,
    },

    #[error("no service handler registered as '{0}'")]
    UnknownHandler(String),

    #[error("exclusive gateway '{0}' has no transition to take")]
    NoTransitionAvailable(String),

    #[error("signal payload must be a JSON object or null")]
    InvalidSignalPayload,
}

/// Failures that abort an engine entry point.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("node '{node}' does not accept signals (execution {execution})")]
    UnsupportedSignal { execution: ExecutionId, node: String },

    #[error("unhandled business error '{error_code}' terminated instance {process_instance}")]
    UnhandledBusinessError {
        error_code: String,
        process_instance: Uuid,
    },

    #[error("listener '{listener}' failed on node '{node}': {message}")]
    Listener {
        listener: String,
        node: String,
        message: String,
    },

    #[error("service handler '{handler}' failed on node '{node}': {message}")]
    Handler {
        handler: String,
        node: String,
        message: String,
    },

    #[error("unknown execution {0}")]
    UnknownExecution(ExecutionId),

    #[error("execution {0} is not an active token")]
    InactiveExecution(ExecutionId),

    #[error("execution {execution} at '{node}' is still waiting on called instance {sub_instance}")]
    SubInstanceActive {
        execution: ExecutionId,
        node: String,
        sub_instance: ExecutionId,
    },

    #[error("process instance {0} is no longer running")]
    InstanceNotRunning(Uuid),

    #[error("process instance {0} was already started")]
    AlreadyStarted(Uuid),

    #[error("dispatch exceeded {0} steps without reaching a wait state")]
    StepLimitExceeded(usize),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl Fault {
    /// True for an unhandled business error, as opposed to a configuration or system failure.
    pub fn is_business(&self) -> bool {
        matches!(self, Fault::UnhandledBusinessError { .. })
    }

    /// True for errors caused by the process model or its runtime data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Fault::Configuration(_) | Fault::Listener { .. } | Fault::Handler { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Fault>;

/// Failure returned by a service handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Business(#[from] BpmnError),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Failure returned by an expression evaluator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("syntax error in '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("cannot evaluate '{expression}': {message}")]
    Evaluation { expression: String, message: String },

    #[error(transparent)]
    Business(#[from] BpmnError),
}

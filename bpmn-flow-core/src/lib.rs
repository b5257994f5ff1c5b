//! Process execution core for BPMN-style workflows.
//!
//! A process instance is an [`ExecutionTree`] of tokens moving over an
//! immutable [`ProcessDefinition`]. The [`Engine`] advances it through the
//! `execute`, `signal` and `leave` entry points; collaborators (definition
//! cache, expression evaluator, listeners, service handlers) are injected via
//! [`Collaborators`].

mod behavior;
pub mod config;
pub mod delegate;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
pub mod model;
pub mod tree;
pub mod types;

pub use config::EngineConfig;
pub use delegate::{
    DelegateExecution, ListenerInvoker, ListenerRegistry, ServiceHandler, ServiceRegistry,
};
pub use engine::{Collaborators, Engine};
pub use error::{BpmnError, ConfigError, ExpressionError, Fault, HandlerError, Outcome};
pub use events::RuntimeEvent;
pub use expr::{DefaultEvaluator, ExpressionEvaluator, VariableScope};
pub use model::registry::{DefinitionProvider, DeployedDefinition, MemoryDefinitionCache};
pub use model::yaml::parse_definition_yaml;
pub use model::{FlowNode, NodeKind, ProcessDefinition, Transition};
pub use tree::{Execution, ExecutionTree};
pub use types::*;

//! Engine facade. Every entry point takes the instance's execution tree and
//! runs the dispatcher until all tokens are parked or ended.

use crate::behavior::{Dispatcher, Operation};
use crate::config::EngineConfig;
use crate::delegate::{ListenerInvoker, ListenerRegistry, ServiceRegistry};
use crate::error::{ConfigError, Fault, Result};
use crate::expr::{DefaultEvaluator, ExpressionEvaluator};
use crate::model::registry::DefinitionProvider;
use crate::tree::ExecutionTree;
use crate::types::*;
use std::sync::Arc;

/// Everything behaviors call out to, passed explicitly into each dispatch.
#[derive(Clone)]
pub struct Collaborators {
    pub definitions: Arc<dyn DefinitionProvider>,
    pub expressions: Arc<dyn ExpressionEvaluator>,
    pub listeners: Arc<dyn ListenerInvoker>,
    pub services: Arc<ServiceRegistry>,
}

impl Collaborators {
    /// Default evaluator, no listeners, no service handlers.
    pub fn new(definitions: Arc<dyn DefinitionProvider>) -> Self {
        Self {
            definitions,
            expressions: Arc::new(DefaultEvaluator),
            listeners: Arc::new(ListenerRegistry::new()),
            services: Arc::new(ServiceRegistry::new()),
        }
    }

    pub fn with_expressions(mut self, expressions: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expressions = expressions;
        self
    }

    pub fn with_listeners(mut self, listeners: Arc<dyn ListenerInvoker>) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = Arc::new(services);
        self
    }
}

pub struct Engine {
    collaborators: Collaborators,
    config: EngineConfig,
}

impl Engine {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A new instance of the latest deployed `process_key`, positioned at its
    /// initial node but not yet started.
    pub fn create_process_instance(
        &self,
        process_key: &str,
        variables: Variables,
    ) -> Result<ExecutionTree> {
        let definition = self
            .collaborators
            .definitions
            .resolve_latest(process_key)?
            .ok_or_else(|| ConfigError::DefinitionNotFound(process_key.to_string()))?;
        let tree = ExecutionTree::new(definition, variables, self.config.record_events);
        tracing::info!(
            instance = %tree.instance_id(),
            process_key,
            "Process instance created"
        );
        Ok(tree)
    }

    /// Execute the root at the initial node.
    #[tracing::instrument(skip_all, fields(instance = %tree.instance_id()))]
    pub fn start(&self, tree: &mut ExecutionTree) -> Result<()> {
        if tree.is_started() {
            return Err(Fault::AlreadyStarted(tree.instance_id()));
        }
        tree.mark_started();
        let root = tree.root();
        let mut dispatcher = self.dispatcher(tree);
        dispatcher.schedule(Operation::Execute(root));
        dispatcher.run()
    }

    /// Create and start in one step. Faults raised while starting drop the
    /// tree; use [`Self::create_process_instance`] and [`Self::start`] to keep it.
    pub fn start_process_instance(
        &self,
        process_key: &str,
        variables: Variables,
    ) -> Result<ExecutionTree> {
        let mut tree = self.create_process_instance(process_key, variables)?;
        self.start(&mut tree)?;
        Ok(tree)
    }

    /// Run the behavior of the node `execution` is positioned at.
    #[tracing::instrument(skip_all, fields(instance = %tree.instance_id(), execution = %execution))]
    pub fn execute(&self, tree: &mut ExecutionTree, execution: ExecutionId) -> Result<()> {
        self.check_active(tree, execution)?;
        let mut dispatcher = self.dispatcher(tree);
        dispatcher.schedule(Operation::Execute(execution));
        dispatcher.run()
    }

    /// Deliver an external trigger to a waiting execution. An object payload is
    /// written to the variables before the node is left; `null` writes nothing.
    #[tracing::instrument(skip_all, fields(instance = %tree.instance_id(), execution = %execution))]
    pub fn signal(
        &self,
        tree: &mut ExecutionTree,
        execution: ExecutionId,
        signal_name: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        self.check_active(tree, execution)?;
        let mut dispatcher = self.dispatcher(tree);
        dispatcher.signal(execution, signal_name, payload)?;
        dispatcher.run()
    }

    /// Complete the node `execution` is positioned at and follow its outgoing flows.
    #[tracing::instrument(skip_all, fields(instance = %tree.instance_id(), execution = %execution))]
    pub fn leave(&self, tree: &mut ExecutionTree, execution: ExecutionId) -> Result<()> {
        self.check_active(tree, execution)?;
        let mut dispatcher = self.dispatcher(tree);
        let outcome = dispatcher.leave(execution)?;
        dispatcher.settle(execution, outcome)?;
        dispatcher.run()
    }

    fn dispatcher<'a>(&'a self, tree: &'a mut ExecutionTree) -> Dispatcher<'a> {
        Dispatcher::new(&self.collaborators, &self.config, tree)
    }

    fn check_active(&self, tree: &ExecutionTree, execution: ExecutionId) -> Result<()> {
        if tree.process_state().is_terminal() {
            return Err(Fault::InstanceNotRunning(tree.instance_id()));
        }
        match tree.execution(execution) {
            None => Err(Fault::UnknownExecution(execution)),
            Some(e) if !e.is_active() || e.node_id.is_none() => {
                Err(Fault::InactiveExecution(execution))
            }
            Some(_) => Ok(()),
        }
    }
}

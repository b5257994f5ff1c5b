//! User code seams: service handlers and execution listeners.

use crate::error::{HandlerError, Result};
use crate::expr::VariableScope;
use crate::model::ListenerEvent;
use crate::tree::ExecutionTree;
use crate::types::*;
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// The execution a handler or listener runs against, with variable access.
pub struct DelegateExecution<'t> {
    tree: &'t mut ExecutionTree,
    id: ExecutionId,
}

impl<'t> DelegateExecution<'t> {
    pub(crate) fn new(tree: &'t mut ExecutionTree, id: ExecutionId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn instance_id(&self) -> Uuid {
        self.tree.instance_id()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.tree.execution(self.id).and_then(|e| e.node_id.as_deref())
    }

    pub fn get_variable(&self, name: &str) -> Option<Value> {
        self.tree.get_variable(self.id, name)
    }

    pub fn get_variable_local(&self, name: &str) -> Option<Value> {
        self.tree.get_variable_local(self.id, name)
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.tree.set_variable(self.id, name, value.into())
    }

    pub fn set_variable_local(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.tree.set_variable_local(self.id, name, value.into())
    }

    pub fn remove_variable_local(&mut self, name: &str) -> Result<Option<Value>> {
        self.tree.remove_variable_local(self.id, name)
    }

    pub fn variables(&self) -> Variables {
        self.tree.variables(self.id)
    }

    /// Index of the enclosing multi-instance iteration, if any.
    pub fn loop_counter(&self) -> Option<u64> {
        self.get_variable(LOOP_COUNTER).and_then(|v| v.as_u64())
    }
}

impl VariableScope for DelegateExecution<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get_variable(name)
    }
}

// ── Service handlers ──

pub trait ServiceHandler: Send + Sync {
    fn execute(
        &self,
        execution: &mut DelegateExecution<'_>,
    ) -> std::result::Result<(), HandlerError>;
}

impl<F> ServiceHandler for F
where
    F: Fn(&mut DelegateExecution<'_>) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    fn execute(
        &self,
        execution: &mut DelegateExecution<'_>,
    ) -> std::result::Result<(), HandlerError> {
        self(execution)
    }
}

/// Handlers by name. The fallback, if set, serves names nobody registered.
#[derive(Default, Clone)]
pub struct ServiceRegistry {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
    fallback: Option<Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ServiceHandler>,
    ) -> &mut Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut DelegateExecution<'_>) -> std::result::Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(handler))
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn ServiceHandler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers
            .get(name)
            .or(self.fallback.as_ref())
            .cloned()
    }
}

// ── Listeners ──

/// Fires node lifecycle events. Errors abort the dispatch.
pub trait ListenerInvoker: Send + Sync {
    fn notify(
        &self,
        listener: &str,
        event: ListenerEvent,
        execution: &mut DelegateExecution<'_>,
    ) -> anyhow::Result<()>;
}

pub trait ExecutionListener: Send + Sync {
    fn notify(
        &self,
        event: ListenerEvent,
        execution: &mut DelegateExecution<'_>,
    ) -> anyhow::Result<()>;
}

impl<F> ExecutionListener for F
where
    F: Fn(ListenerEvent, &mut DelegateExecution<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn notify(
        &self,
        event: ListenerEvent,
        execution: &mut DelegateExecution<'_>,
    ) -> anyhow::Result<()> {
        self(event, execution)
    }
}

#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: HashMap<String, Arc<dyn ExecutionListener>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        listener: Arc<dyn ExecutionListener>,
    ) -> &mut Self {
        self.listeners.insert(name.into(), listener);
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, listener: F) -> &mut Self
    where
        F: Fn(ListenerEvent, &mut DelegateExecution<'_>) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(listener))
    }
}

impl ListenerInvoker for ListenerRegistry {
    fn notify(
        &self,
        listener: &str,
        event: ListenerEvent,
        execution: &mut DelegateExecution<'_>,
    ) -> anyhow::Result<()> {
        let target = self
            .listeners
            .get(listener)
            .ok_or_else(|| anyhow!("no listener registered as '{}'", listener))?;
        target.notify(event, execution)
    }
}

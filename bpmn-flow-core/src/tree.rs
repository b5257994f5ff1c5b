//! The execution tree: every token of one process instance, including the
//! trees of sub-process instances started by its call activities.
//!
//! Executions live in an arena indexed by [`ExecutionId`]. Parent and child
//! links are ids; a parent owns its child list, the `parent` field is a
//! navigation handle only. Ended executions keep their slot until
//! [`ExecutionTree::prune_ended`] invalidates it.

use crate::error::{Fault, Result};
use crate::events::RuntimeEvent;
use crate::expr::VariableScope;
use crate::model::ProcessDefinition;
use crate::types::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ─── Execution ────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Root of the (sub-)process instance this execution belongs to.
    pub process_instance: ExecutionId,
    /// Current flow node; `None` for pure scope containers.
    pub node_id: Option<String>,
    pub parent: Option<ExecutionId>,
    pub children: Vec<ExecutionId>,
    pub variables: Variables,
    pub state: ExecutionState,
    pub role: ExecutionRole,
    /// One of several sibling tokens created by a fan-out.
    pub concurrent: bool,
    /// Scope holding concurrent children after a fan-out.
    pub concurrent_root: bool,
    /// Calling execution, set on the root of a called sub-process instance.
    pub super_execution: Option<ExecutionId>,
    /// Root of the sub-process instance this call activity waits on.
    pub sub_instance: Option<ExecutionId>,
    pub end_reason: Option<EndReason>,
    /// Resolved collection of a loop scope; iterations bind their element from it.
    #[serde(skip)]
    pub(crate) loop_collection: Option<Vec<Value>>,
}

impl Execution {
    fn new(
        id: ExecutionId,
        process_instance: ExecutionId,
        parent: Option<ExecutionId>,
        role: ExecutionRole,
        node_id: Option<String>,
    ) -> Self {
        Self {
            id,
            process_instance,
            node_id,
            parent,
            children: Vec::new(),
            variables: Variables::new(),
            state: ExecutionState::Active,
            role,
            concurrent: false,
            concurrent_root: false,
            super_execution: None,
            sub_instance: None,
            end_reason: None,
            loop_collection: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ExecutionState::Active
    }

    pub fn is_ended(&self) -> bool {
        self.state == ExecutionState::Ended
    }

    pub fn is_process_instance(&self) -> bool {
        self.role == ExecutionRole::ProcessInstance
    }
}

// ─── Tree ─────────────────────────────────────────────────────

pub struct ExecutionTree {
    instance_id: Uuid,
    process_key: String,
    state: ProcessState,
    root: ExecutionId,
    slots: Vec<Option<Execution>>,
    /// Definition per process-instance root (the top root and every sub-instance root).
    definitions: HashMap<ExecutionId, Arc<ProcessDefinition>>,
    journal: Vec<(u64, RuntimeEvent)>,
    record_events: bool,
    started: bool,
}

impl ExecutionTree {
    /// A new, not yet started instance of `definition`. The root is positioned
    /// at the initial node.
    pub(crate) fn new(
        definition: Arc<ProcessDefinition>,
        variables: Variables,
        record_events: bool,
    ) -> Self {
        let root = ExecutionId(0);
        let mut execution = Execution::new(
            root,
            root,
            None,
            ExecutionRole::ProcessInstance,
            Some(definition.initial.clone()),
        );
        execution.variables = variables;

        let mut tree = Self {
            instance_id: Uuid::now_v7(),
            process_key: definition.key.clone(),
            state: ProcessState::Running,
            root,
            slots: vec![Some(execution)],
            definitions: HashMap::from([(root, definition)]),
            journal: Vec::new(),
            record_events,
            started: false,
        };
        tree.record(RuntimeEvent::InstanceStarted {
            instance: root,
            process_key: tree.process_key.clone(),
            super_execution: None,
        });
        tree
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn process_key(&self) -> &str {
        &self.process_key
    }

    pub fn root(&self) -> ExecutionId {
        self.root
    }

    pub fn process_state(&self) -> &ProcessState {
        &self.state
    }

    pub(crate) fn set_process_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub fn execution(&self, id: ExecutionId) -> Option<&Execution> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Live and ended executions that have not been pruned, in creation order.
    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.slots.iter().flatten()
    }

    pub(crate) fn get(&self, id: ExecutionId) -> Result<&Execution> {
        self.execution(id).ok_or(Fault::UnknownExecution(id))
    }

    pub(crate) fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(Fault::UnknownExecution(id))
    }

    /// Definition of the (sub-)process instance `id` belongs to.
    pub fn definition(&self, id: ExecutionId) -> Result<Arc<ProcessDefinition>> {
        let instance = self.get(id)?.process_instance;
        self.definitions
            .get(&instance)
            .cloned()
            .ok_or(Fault::UnknownExecution(instance))
    }

    /// Root of the (sub-)process instance `id` belongs to.
    pub fn instance_root(&self, id: ExecutionId) -> Result<ExecutionId> {
        Ok(self.get(id)?.process_instance)
    }

    fn allocate(&mut self, execution: Execution) -> ExecutionId {
        let id = execution.id;
        self.slots.push(Some(execution));
        id
    }

    fn next_id(&self) -> ExecutionId {
        ExecutionId(self.slots.len() as u32)
    }

    /// Append a child under `parent`. The child starts Active.
    pub(crate) fn create_child(
        &mut self,
        parent: ExecutionId,
        role: ExecutionRole,
        node_id: Option<String>,
    ) -> Result<ExecutionId> {
        let process_instance = self.get(parent)?.process_instance;
        let id = self.next_id();
        self.allocate(Execution::new(id, process_instance, Some(parent), role, node_id));
        self.get_mut(parent)?.children.push(id);
        self.record(RuntimeEvent::ExecutionCreated {
            execution: id,
            parent: Some(parent),
            role,
        });
        Ok(id)
    }

    /// New independent root for a called process, linked to `caller` through
    /// `super_execution` / `sub_instance` but not a child of it.
    pub(crate) fn create_sub_instance(
        &mut self,
        caller: ExecutionId,
        definition: Arc<ProcessDefinition>,
    ) -> Result<ExecutionId> {
        let id = self.next_id();
        let mut root = Execution::new(
            id,
            id,
            None,
            ExecutionRole::ProcessInstance,
            Some(definition.initial.clone()),
        );
        root.super_execution = Some(caller);
        self.get(caller)?;
        let process_key = definition.key.clone();
        self.allocate(root);
        self.definitions.insert(id, definition);
        self.get_mut(caller)?.sub_instance = Some(id);
        self.record(RuntimeEvent::InstanceStarted {
            instance: id,
            process_key,
            super_execution: Some(caller),
        });
        Ok(id)
    }

    // ─── Variables ────────────────────────────────────────────

    /// Nearest definition of `name`, walking up the parent chain.
    pub fn get_variable(&self, id: ExecutionId, name: &str) -> Option<Value> {
        let mut current = self.execution(id);
        while let Some(execution) = current {
            if let Some(value) = execution.variables.get(name) {
                return Some(value.clone());
            }
            current = execution.parent.and_then(|p| self.execution(p));
        }
        None
    }

    pub fn get_variable_local(&self, id: ExecutionId, name: &str) -> Option<Value> {
        self.execution(id)
            .and_then(|e| e.variables.get(name).cloned())
    }

    pub fn has_variable(&self, id: ExecutionId, name: &str) -> bool {
        self.get_variable(id, name).is_some()
    }

    /// Overwrites the nearest existing definition of `name`; a variable nobody
    /// defines yet is created on the instance root.
    pub fn set_variable(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<()> {
        let mut target = id;
        loop {
            let execution = self.get(target)?;
            if execution.variables.contains_key(name) {
                break;
            }
            match execution.parent {
                Some(parent) => target = parent,
                None => break,
            }
        }
        self.set_variable_local(target, name, value)
    }

    pub fn set_variable_local(&mut self, id: ExecutionId, name: &str, value: Value) -> Result<()> {
        self.get_mut(id)?.variables.insert(name.to_string(), value);
        Ok(())
    }

    pub fn remove_variable_local(&mut self, id: ExecutionId, name: &str) -> Result<Option<Value>> {
        Ok(self.get_mut(id)?.variables.remove(name))
    }

    /// All variables visible from `id`; inner scopes shadow outer ones.
    pub fn variables(&self, id: ExecutionId) -> Variables {
        let mut chain = Vec::new();
        let mut current = self.execution(id);
        while let Some(execution) = current {
            chain.push(execution);
            current = execution.parent.and_then(|p| self.execution(p));
        }
        let mut collected = Variables::new();
        for execution in chain.into_iter().rev() {
            collected.extend(execution.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        collected
    }

    /// Expression scope as seen from `id`.
    pub fn scope(&self, id: ExecutionId) -> ExecutionScope<'_> {
        ExecutionScope { tree: self, id }
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// End `id`, its descendants and any sub-process instance it waits on, and
    /// detach it from its parent. Returns every execution ended by the call.
    pub(crate) fn end_execution(&mut self, id: ExecutionId, reason: EndReason) -> Vec<ExecutionId> {
        let mut ended = Vec::new();
        self.end_subtree(id, &reason, &mut ended);
        let parent = self.execution(id).and_then(|e| e.parent);
        if let Some(parent) = parent
            .and_then(|p| self.slots.get_mut(p.0 as usize))
            .and_then(Option::as_mut)
        {
            parent.children.retain(|c| *c != id);
        }
        ended
    }

    /// End everything below `id` (children and sub-process instance), leaving `id` itself alive.
    pub(crate) fn destroy_descendants(
        &mut self,
        id: ExecutionId,
        cause: &str,
    ) -> Vec<ExecutionId> {
        let reason = EndReason::Destroyed {
            cause: cause.to_string(),
        };
        let (children, sub) = match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(execution) => (
                std::mem::take(&mut execution.children),
                execution.sub_instance.take(),
            ),
            None => return Vec::new(),
        };
        let mut ended = Vec::new();
        for child in children {
            self.end_subtree(child, &reason, &mut ended);
        }
        if let Some(sub) = sub {
            self.end_subtree(sub, &reason, &mut ended);
        }
        ended
    }

    fn end_subtree(&mut self, id: ExecutionId, reason: &EndReason, ended: &mut Vec<ExecutionId>) {
        let (children, sub) = match self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            Some(execution) if !execution.is_ended() => (
                std::mem::take(&mut execution.children),
                execution.sub_instance.take(),
            ),
            _ => return,
        };
        for child in children {
            self.end_subtree(child, reason, ended);
        }
        if let Some(sub) = sub {
            self.end_subtree(sub, reason, ended);
        }
        if let Some(execution) = self.slots.get_mut(id.0 as usize).and_then(Option::as_mut) {
            execution.state = ExecutionState::Ended;
            execution.end_reason = Some(reason.clone());
        }
        tracing::trace!(execution = %id, ?reason, "Execution ended");
        self.record(RuntimeEvent::ExecutionEnded {
            execution: id,
            reason: reason.clone(),
        });
        ended.push(id);
    }

    // ─── Queries ──────────────────────────────────────────────

    /// First active execution positioned at `node_id`, in creation order.
    pub fn find_active_execution(&self, node_id: &str) -> Option<ExecutionId> {
        self.executions()
            .find(|e| e.is_active() && e.node_id.as_deref() == Some(node_id))
            .map(|e| e.id)
    }

    /// Nodes of all active executions, in creation order; duplicates kept.
    pub fn active_node_ids(&self) -> Vec<String> {
        self.executions()
            .filter(|e| e.is_active())
            .filter_map(|e| e.node_id.clone())
            .collect()
    }

    pub fn children(&self, id: ExecutionId) -> &[ExecutionId] {
        self.execution(id).map(|e| e.children.as_slice()).unwrap_or(&[])
    }

    /// Invalidate the slots of ended executions. The top-level root is kept.
    /// Returns the number of slots freed.
    pub fn prune_ended(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            let prune = matches!(slot, Some(e) if e.is_ended() && e.id != self.root);
            if prune {
                if let Some(execution) = slot.take() {
                    self.definitions.remove(&execution.id);
                    freed += 1;
                }
            }
        }
        freed
    }

    // ─── Journal ──────────────────────────────────────────────

    pub(crate) fn record(&mut self, event: RuntimeEvent) {
        if self.record_events {
            let seq = self.journal.len() as u64 + 1;
            self.journal.push((seq, event));
        }
    }

    /// The audit trail with sequence numbers starting at 1.
    pub fn events(&self) -> &[(u64, RuntimeEvent)] {
        &self.journal
    }
}

impl std::fmt::Debug for ExecutionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionTree")
            .field("instance_id", &self.instance_id)
            .field("process_key", &self.process_key)
            .field("state", &self.state)
            .field("executions", &self.executions().count())
            .finish()
    }
}

/// Variable lookup from one execution, with parent-chain fallback.
pub struct ExecutionScope<'t> {
    tree: &'t ExecutionTree,
    id: ExecutionId,
}

impl VariableScope for ExecutionScope<'_> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.tree.get_variable(self.id, name)
    }
}

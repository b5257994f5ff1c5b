//! Leaving nodes: outgoing transition selection, fan-out, and token ends.

use super::{Dispatcher, Operation, Resolved};
use crate::error::{ConfigError, Fault, Outcome, Result};
use crate::events::RuntimeEvent;
use crate::model::{FlowNode, ListenerEvent, NodeKind};
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaveMode {
    /// Every true condition is taken; default flows only when nothing else is.
    Conditional,
    /// Every outgoing transition is taken.
    IgnoreConditions,
    /// First true condition, else the default flow; nothing to take is an error.
    Exclusive,
}

impl Dispatcher<'_> {
    pub(crate) fn leave(&mut self, id: ExecutionId) -> Result<Outcome> {
        self.leave_with(id, LeaveMode::Conditional)
    }

    pub(crate) fn leave_ignoring_conditions(&mut self, id: ExecutionId) -> Result<Outcome> {
        self.leave_with(id, LeaveMode::IgnoreConditions)
    }

    pub(crate) fn leave_with(&mut self, id: ExecutionId, mode: LeaveMode) -> Result<Outcome> {
        let execution = self.tree.get(id)?;
        let role = execution.role;
        let parent = execution.parent;
        let attached = execution.sub_instance;
        let Some(node_id) = execution.node_id.clone() else {
            return Err(Fault::InactiveExecution(id));
        };
        let def = self.tree.definition(id)?;
        let node = def.require_node(&node_id)?;

        if let Some(sub_instance) = attached {
            let destroyed = self.tree.destroy_descendants(id, "call activity left");
            tracing::debug!(
                execution = %id,
                sub_instance = %sub_instance,
                destroyed = destroyed.len(),
                "Called instance cancelled"
            );
        }

        // A multi-instance node fires listeners per iteration, not for the loop as a whole.
        if node.multi_instance.is_none() || role.is_loop_member() {
            self.fire_listeners(id, node, ListenerEvent::End)?;
        }

        match (role, parent) {
            (ExecutionRole::LoopIteration, _) => return self.complete_iteration(id),
            (ExecutionRole::LoopBody, Some(iteration)) => {
                self.tree.end_execution(id, EndReason::Completed);
                return self.complete_iteration(iteration);
            }
            _ => {}
        }

        let targets = resolve!(self.select_transitions(id, node, mode)?);
        self.take_transitions(id, node, targets)
    }

    fn select_transitions(
        &self,
        id: ExecutionId,
        node: &FlowNode,
        mode: LeaveMode,
    ) -> Result<Resolved<Vec<String>>> {
        if mode == LeaveMode::IgnoreConditions {
            return Ok(Resolved::Value(
                node.outgoing.iter().map(|t| t.target.clone()).collect(),
            ));
        }

        let mut taken = Vec::new();
        for transition in node.outgoing.iter().filter(|t| !t.default) {
            let holds = match &transition.condition {
                None => true,
                Some(condition) => match self.evaluate_bool(id, &node.id, condition)? {
                    Resolved::Value(b) => b,
                    Resolved::Raised(error) => return Ok(Resolved::Raised(error)),
                },
            };
            if holds {
                taken.push(transition.target.clone());
                if mode == LeaveMode::Exclusive {
                    break;
                }
            }
        }

        if taken.is_empty() {
            taken.extend(
                node.outgoing
                    .iter()
                    .filter(|t| t.default)
                    .map(|t| t.target.clone()),
            );
        }
        if taken.is_empty() && mode == LeaveMode::Exclusive {
            return Err(ConfigError::NoTransitionAvailable(node.id.clone()).into());
        }
        Ok(Resolved::Value(taken))
    }

    /// Zero targets end the token, one moves it, several fork it into concurrent children.
    fn take_transitions(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        mut targets: Vec<String>,
    ) -> Result<Outcome> {
        if targets.len() > 1 {
            return self.fork(id, node, targets);
        }
        match targets.pop() {
            None => {
                let reason = if node.outgoing.is_empty() {
                    EndReason::Completed
                } else {
                    tracing::debug!(execution = %id, node = %node.id, "No outgoing condition held");
                    EndReason::NoTransitionTaken
                };
                self.end_token(id, reason)
            }
            Some(target) => {
                tracing::debug!(execution = %id, from = %node.id, to = %target, "Transition");
                self.tree.record(RuntimeEvent::TransitionTaken {
                    execution: id,
                    from: node.id.clone(),
                    to: target.clone(),
                });
                self.tree.get_mut(id)?.node_id = Some(target);
                self.schedule(Operation::Execute(id));
                Ok(Outcome::Continue)
            }
        }
    }

    /// `id` becomes a concurrent root with one child token per target.
    fn fork(&mut self, id: ExecutionId, node: &FlowNode, targets: Vec<String>) -> Result<Outcome> {
        {
            let execution = self.tree.get_mut(id)?;
            execution.state = ExecutionState::Scope;
            execution.concurrent_root = true;
            execution.node_id = None;
        }
        let mut children = Vec::with_capacity(targets.len());
        for target in targets {
            let child = self
                .tree
                .create_child(id, ExecutionRole::Branch, Some(target.clone()))?;
            self.tree.get_mut(child)?.concurrent = true;
            self.tree.record(RuntimeEvent::TransitionTaken {
                execution: child,
                from: node.id.clone(),
                to: target,
            });
            self.schedule(Operation::Execute(child));
            children.push(child);
        }
        tracing::debug!(execution = %id, node = %node.id, branches = children.len(), "Fork");
        self.tree.record(RuntimeEvent::Forked {
            execution: id,
            node_id: node.id.clone(),
            children,
        });
        Ok(Outcome::Continue)
    }

    /// End a token and notify whatever contains it.
    pub(crate) fn end_token(&mut self, id: ExecutionId, reason: EndReason) -> Result<Outcome> {
        let parent = self.tree.get(id)?.parent;
        self.tree.end_execution(id, reason);
        match parent {
            Some(parent) => self.child_ended(parent),
            None => self.instance_ended(id),
        }
    }

    /// A child of `parent` ended. The last one out completes fork roots and
    /// embedded sub-process scopes.
    fn child_ended(&mut self, parent: ExecutionId) -> Result<Outcome> {
        let execution = self.tree.get(parent)?;
        if execution.is_ended() || !execution.children.is_empty() {
            return Ok(Outcome::Continue);
        }
        if execution.concurrent_root {
            return self.end_token(parent, EndReason::Completed);
        }
        let completes_scope = matches!(
            execution.role,
            ExecutionRole::ProcessInstance | ExecutionRole::Branch | ExecutionRole::LoopBody
        );
        if execution.state != ExecutionState::Scope || !completes_scope {
            return Ok(Outcome::Continue);
        }

        let Some(node_id) = execution.node_id.clone() else {
            return Ok(Outcome::Continue);
        };
        let def = self.tree.definition(parent)?;
        if matches!(def.require_node(&node_id)?.kind, NodeKind::SubProcess { .. }) {
            tracing::debug!(execution = %parent, node = %node_id, "Sub-process scope completed");
            self.tree.get_mut(parent)?.state = ExecutionState::Active;
            self.schedule(Operation::Leave(parent));
        }
        Ok(Outcome::Continue)
    }

    /// A (sub-)process instance root ended.
    fn instance_ended(&mut self, root: ExecutionId) -> Result<Outcome> {
        let caller = self.tree.get(root)?.super_execution;
        match caller {
            Some(caller) => {
                // Only the instance the caller still waits on resumes it.
                if self.tree.get(caller)?.sub_instance != Some(root) {
                    tracing::debug!(
                        caller = %caller,
                        sub_instance = %root,
                        "Detached instance ended"
                    );
                    return Ok(Outcome::Continue);
                }
                let outcome = self.complete_call_activity(caller, root)?;
                self.settle(caller, outcome)?;
            }
            None => {
                tracing::info!(
                    instance = %self.tree.instance_id(),
                    process_key = %self.tree.process_key(),
                    "Process instance completed"
                );
                self.tree.set_process_state(ProcessState::Completed);
                self.tree.record(RuntimeEvent::InstanceCompleted { instance: root });
            }
        }
        Ok(Outcome::Continue)
    }
}

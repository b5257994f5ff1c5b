//! Behavior dispatch: maps flow nodes to behaviors and drives an agenda of
//! execute/leave operations until every token is parked or ended.

/// Unwraps a [`Resolved`] value, or returns the raised business error as the
/// enclosing function's `Ok(Outcome)`.
macro_rules! resolve {
    ($e:expr) => {
        match $e {
            Resolved::Value(v) => v,
            Resolved::Raised(error) => return Ok(Outcome::BusinessError(error)),
        }
    };
}

mod call_activity;
mod multi_instance;
mod propagation;
mod transition;

use crate::config::EngineConfig;
use crate::delegate::DelegateExecution;
use crate::engine::Collaborators;
use crate::error::{BpmnError, ConfigError, ExpressionError, Fault, HandlerError, Outcome, Result};
use crate::events::RuntimeEvent;
use crate::expr::type_name;
use crate::model::{DataAssociation, FlowNode, ListenerEvent, LoopCharacteristics, NodeKind};
use crate::tree::ExecutionTree;
use crate::types::*;
use std::collections::VecDeque;

pub(crate) use transition::LeaveMode;

/// A value from the expression evaluator, or the business error it raised.
pub(crate) enum Resolved<T> {
    Value(T),
    Raised(BpmnError),
}

/// Runtime behavior of a flow node. `MultiInstance` decorates the node's own behavior.
#[derive(Debug)]
pub(crate) enum Behavior<'n> {
    Passthrough,
    Service {
        handler: &'n str,
    },
    ExclusiveGateway,
    ParallelGateway,
    Wait,
    SubProcess {
        initial: &'n str,
    },
    CallActivity {
        called_element: &'n str,
        inputs: &'n [DataAssociation],
        outputs: &'n [DataAssociation],
    },
    ErrorEnd {
        error_code: &'n str,
    },
    MultiInstance {
        inner: Box<Behavior<'n>>,
        characteristics: &'n LoopCharacteristics,
    },
}

impl<'n> Behavior<'n> {
    pub(crate) fn for_node(node: &'n FlowNode) -> Self {
        let behavior = Self::unwrapped(&node.kind);
        match &node.multi_instance {
            Some(characteristics) => Behavior::MultiInstance {
                inner: Box::new(behavior),
                characteristics,
            },
            None => behavior,
        }
    }

    fn unwrapped(kind: &'n NodeKind) -> Self {
        match kind {
            NodeKind::StartEvent
            | NodeKind::EndEvent
            | NodeKind::Task
            | NodeKind::BoundaryErrorEvent { .. } => Behavior::Passthrough,
            NodeKind::IntermediateEvent | NodeKind::ReceiveTask | NodeKind::UserTask => {
                Behavior::Wait
            }
            NodeKind::ServiceTask { handler } => Behavior::Service { handler },
            NodeKind::ExclusiveGateway => Behavior::ExclusiveGateway,
            NodeKind::ParallelGateway => Behavior::ParallelGateway,
            NodeKind::SubProcess { initial } => Behavior::SubProcess { initial },
            NodeKind::CallActivity {
                called_element,
                inputs,
                outputs,
            } => Behavior::CallActivity {
                called_element,
                inputs,
                outputs,
            },
            NodeKind::ErrorEndEvent { error_code } => Behavior::ErrorEnd { error_code },
        }
    }

    /// Behaviors that own child executions of their own.
    pub(crate) fn is_scope(&self) -> bool {
        matches!(self, Behavior::SubProcess { .. })
    }
}

// ─── Dispatcher ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Execute(ExecutionId),
    Leave(ExecutionId),
}

pub(crate) struct Dispatcher<'a> {
    pub(crate) ctx: &'a Collaborators,
    pub(crate) config: &'a EngineConfig,
    pub(crate) tree: &'a mut ExecutionTree,
    agenda: VecDeque<Operation>,
}

impl<'a> Dispatcher<'a> {
    pub(crate) fn new(
        ctx: &'a Collaborators,
        config: &'a EngineConfig,
        tree: &'a mut ExecutionTree,
    ) -> Self {
        Self {
            ctx,
            config,
            tree,
            agenda: VecDeque::new(),
        }
    }

    pub(crate) fn schedule(&mut self, op: Operation) {
        self.agenda.push_back(op);
    }

    /// Drain the agenda. Operations whose execution is no longer active are skipped.
    pub(crate) fn run(&mut self) -> Result<()> {
        let mut steps = 0usize;
        while let Some(op) = self.agenda.pop_front() {
            steps += 1;
            if steps > self.config.max_steps {
                self.agenda.clear();
                return Err(Fault::StepLimitExceeded(self.config.max_steps));
            }
            match op {
                Operation::Execute(id) => self.perform_execute(id)?,
                Operation::Leave(id) => {
                    if !self.is_active(id) {
                        continue;
                    }
                    let outcome = self.leave(id)?;
                    self.settle(id, outcome)?;
                }
            }
        }
        Ok(())
    }

    fn is_active(&self, id: ExecutionId) -> bool {
        self.tree.execution(id).is_some_and(|e| e.is_active())
    }

    fn perform_execute(&mut self, id: ExecutionId) -> Result<()> {
        let Some(execution) = self.tree.execution(id).filter(|e| e.is_active()) else {
            return Ok(());
        };
        let Some(node_id) = execution.node_id.clone() else {
            return Ok(());
        };
        if let Some(sub_instance) = execution.sub_instance {
            return Err(Fault::SubInstanceActive {
                execution: id,
                node: node_id,
                sub_instance,
            });
        }
        let def = self.tree.definition(id)?;
        let node = def.require_node(&node_id)?;
        let behavior = Behavior::for_node(node);

        tracing::debug!(execution = %id, node = %node.id, kind = node.kind.name(), "Entering node");
        self.tree.record(RuntimeEvent::NodeEntered {
            execution: id,
            node_id: node.id.clone(),
        });

        let outcome = self.execute_behavior(id, node, &behavior)?;
        self.settle(id, outcome)
    }

    /// Run `behavior` on `id`. Start listeners fire before any non-decorator behavior.
    pub(crate) fn execute_behavior(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        behavior: &Behavior<'_>,
    ) -> Result<Outcome> {
        if !matches!(behavior, Behavior::MultiInstance { .. }) {
            self.fire_listeners(id, node, ListenerEvent::Start)?;
        }
        match behavior {
            Behavior::Passthrough => self.leave(id),
            Behavior::Service { handler } => self.run_service(id, node, handler),
            Behavior::ExclusiveGateway => self.leave_with(id, LeaveMode::Exclusive),
            Behavior::ParallelGateway => self.leave_with(id, LeaveMode::IgnoreConditions),
            Behavior::Wait => {
                tracing::debug!(execution = %id, node = %node.id, "Waiting for signal");
                Ok(Outcome::Wait)
            }
            Behavior::SubProcess { initial } => self.enter_sub_process(id, initial),
            Behavior::CallActivity {
                called_element,
                inputs,
                ..
            } => self.start_call_activity(id, node, called_element, inputs),
            Behavior::ErrorEnd { error_code } => {
                Ok(Outcome::BusinessError(BpmnError::new(*error_code)))
            }
            Behavior::MultiInstance {
                inner,
                characteristics,
            } => self.execute_multi_instance(id, node, inner, characteristics),
        }
    }

    /// Route a behavior outcome: business errors go to the error propagator.
    pub(crate) fn settle(&mut self, id: ExecutionId, outcome: Outcome) -> Result<()> {
        match outcome {
            Outcome::Continue | Outcome::Wait => Ok(()),
            Outcome::BusinessError(error) => self.propagate(id, error),
        }
    }

    // ─── Signals ──────────────────────────────────────────────

    pub(crate) fn signal(
        &mut self,
        id: ExecutionId,
        signal_name: Option<&str>,
        payload: Value,
    ) -> Result<()> {
        let execution = self.tree.get(id)?;
        let Some(node_id) = execution.node_id.clone().filter(|_| execution.is_active()) else {
            return Err(Fault::InactiveExecution(id));
        };
        let def = self.tree.definition(id)?;
        let node = def.require_node(&node_id)?;
        let behavior = Behavior::for_node(node);

        let outcome = self.signal_behavior(id, node, &behavior, signal_name, payload)?;
        self.settle(id, outcome)
    }

    fn signal_behavior(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        behavior: &Behavior<'_>,
        signal_name: Option<&str>,
        payload: Value,
    ) -> Result<Outcome> {
        match behavior {
            Behavior::Wait => {
                tracing::info!(
                    execution = %id,
                    node = %node.id,
                    signal = ?signal_name,
                    "Signal received"
                );
                self.tree.record(RuntimeEvent::SignalReceived {
                    execution: id,
                    node_id: node.id.clone(),
                    signal_name: signal_name.map(str::to_string),
                });
                self.apply_payload(id, payload)?;
                self.leave(id)
            }
            Behavior::MultiInstance { inner, .. } if self.tree.get(id)?.role.is_loop_member() => {
                self.signal_behavior(id, node, inner, signal_name, payload)
            }
            _ => Err(Fault::UnsupportedSignal {
                execution: id,
                node: node.id.clone(),
            }),
        }
    }

    fn apply_payload(&mut self, id: ExecutionId, payload: Value) -> Result<()> {
        match payload {
            Value::Null => Ok(()),
            Value::Object(entries) => {
                for (name, value) in entries {
                    self.tree.set_variable(id, &name, value)?;
                }
                Ok(())
            }
            _ => Err(ConfigError::InvalidSignalPayload.into()),
        }
    }

    // ─── Simple behaviors ─────────────────────────────────────

    fn run_service(&mut self, id: ExecutionId, node: &FlowNode, handler: &str) -> Result<Outcome> {
        let service = self
            .ctx
            .services
            .lookup(handler)
            .ok_or_else(|| ConfigError::UnknownHandler(handler.to_string()))?;
        let result = service.execute(&mut DelegateExecution::new(self.tree, id));
        match result {
            Ok(()) => self.leave(id),
            Err(HandlerError::Business(error)) => {
                tracing::debug!(
                    execution = %id,
                    node = %node.id,
                    code = %error.error_code,
                    "Handler raised business error"
                );
                Ok(Outcome::BusinessError(error))
            }
            Err(HandlerError::Failed(e)) => Err(Fault::Handler {
                handler: handler.to_string(),
                node: node.id.clone(),
                message: format!("{:#}", e),
            }),
        }
    }

    fn enter_sub_process(&mut self, id: ExecutionId, initial: &str) -> Result<Outcome> {
        self.tree.get_mut(id)?.state = ExecutionState::Scope;
        let child = self
            .tree
            .create_child(id, ExecutionRole::Branch, Some(initial.to_string()))?;
        self.schedule(Operation::Execute(child));
        Ok(Outcome::Continue)
    }

    // ─── Collaborator helpers ─────────────────────────────────

    pub(crate) fn fire_listeners(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        event: ListenerEvent,
    ) -> Result<()> {
        for binding in node.listeners.iter().filter(|b| b.event == event) {
            let mut delegate = DelegateExecution::new(self.tree, id);
            self.ctx
                .listeners
                .notify(&binding.listener, event, &mut delegate)
                .map_err(|e| Fault::Listener {
                    listener: binding.listener.clone(),
                    node: node.id.clone(),
                    message: format!("{:#}", e),
                })?;
        }
        Ok(())
    }

    /// Evaluate `expression` in the variable scope of `id`.
    pub(crate) fn evaluate(
        &self,
        id: ExecutionId,
        node_id: &str,
        expression: &str,
    ) -> Result<Resolved<Value>> {
        match self.ctx.expressions.evaluate(expression, &self.tree.scope(id)) {
            Ok(value) => Ok(Resolved::Value(value)),
            Err(ExpressionError::Business(error)) => Ok(Resolved::Raised(error)),
            Err(e) => Err(ConfigError::Expression {
                node: node_id.to_string(),
                expression: expression.to_string(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    /// Like [`Self::evaluate`], but the result must be a boolean.
    pub(crate) fn evaluate_bool(
        &self,
        id: ExecutionId,
        node_id: &str,
        expression: &str,
    ) -> Result<Resolved<bool>> {
        Ok(match self.evaluate(id, node_id, expression)? {
            Resolved::Value(Value::Bool(b)) => Resolved::Value(b),
            Resolved::Value(other) => {
                return Err(ConfigError::UnexpectedType {
                    node: node_id.to_string(),
                    expression: expression.to_string(),
                    expected: "a boolean",
                    found: type_name(&other).to_string(),
                }
                .into())
            }
            Resolved::Raised(error) => Resolved::Raised(error),
        })
    }
}

//! Multi-instance decorator: sequential and parallel repetition of a node's
//! own behavior over a cardinality or a collection.
//!
//! Layout below the arriving execution `T` (which becomes a scope):
//!
//! ```text
//! T (Scope, node N)
//! └── loop scope (nrOfInstances, nrOfActiveInstances, nrOfCompletedInstances)
//!     ├── iteration 0 (node N, loopCounter, element variable)
//!     │   └── loop body (node N)   only when N is itself a scope
//!     └── iteration 1 ...
//! ```
//!
//! Sequential loops reuse one iteration execution; parallel loops create all
//! iterations up front.

use super::{Behavior, Dispatcher, Operation, Resolved};
use crate::error::{ConfigError, Fault, Outcome, Result};
use crate::events::RuntimeEvent;
use crate::expr::type_name;
use crate::model::{is_expression, FlowNode, LoopCharacteristics};
use crate::types::*;

impl Dispatcher<'_> {
    pub(crate) fn execute_multi_instance(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        inner: &Behavior<'_>,
        characteristics: &LoopCharacteristics,
    ) -> Result<Outcome> {
        match self.tree.get(id)?.role {
            ExecutionRole::LoopIteration if inner.is_scope() => {
                // Keep the inner scope's children and variables apart from the iteration.
                self.tree.get_mut(id)?.state = ExecutionState::Scope;
                let body =
                    self.tree
                        .create_child(id, ExecutionRole::LoopBody, Some(node.id.clone()))?;
                self.schedule(Operation::Execute(body));
                Ok(Outcome::Continue)
            }
            role if role.is_loop_member() => self.execute_behavior(id, node, inner),
            _ => self.start_loop(id, node, characteristics),
        }
    }

    /// Initiating call: resolve the instances and create the loop scope.
    fn start_loop(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        characteristics: &LoopCharacteristics,
    ) -> Result<Outcome> {
        let (count, collection) = resolve!(self.resolve_instances(id, node, characteristics)?);
        let sequential = characteristics.sequential;

        if count == 0 {
            tracing::info!(execution = %id, node = %node.id, "Multi-instance has no instances");
            self.tree.record(RuntimeEvent::LoopCompleted {
                node_id: node.id.clone(),
                nr_of_instances: 0,
                nr_of_completed_instances: 0,
                early: false,
            });
            return self.leave_ignoring_conditions(id);
        }

        self.tree.get_mut(id)?.state = ExecutionState::Scope;
        let scope = self.tree.create_child(id, ExecutionRole::LoopScope, None)?;
        let active = if sequential { 1 } else { count };
        self.tree
            .set_variable_local(scope, NR_OF_INSTANCES, Value::from(count))?;
        self.tree
            .set_variable_local(scope, NR_OF_ACTIVE_INSTANCES, Value::from(active))?;
        self.tree
            .set_variable_local(scope, NR_OF_COMPLETED_INSTANCES, Value::from(0u64))?;
        self.tree.get_mut(scope)?.loop_collection = collection;

        tracing::info!(
            execution = %id,
            node = %node.id,
            instances = count,
            sequential,
            "Multi-instance started"
        );
        self.tree.record(RuntimeEvent::LoopStarted {
            scope,
            node_id: node.id.clone(),
            nr_of_instances: count,
            sequential,
        });

        let iterations = if sequential { 1 } else { count };
        for index in 0..iterations {
            let iteration = self.tree.create_child(
                scope,
                ExecutionRole::LoopIteration,
                Some(node.id.clone()),
            )?;
            self.tree.get_mut(iteration)?.concurrent = !sequential;
            self.begin_iteration(scope, iteration, node, characteristics, index)?;
        }
        Ok(Outcome::Continue)
    }

    fn resolve_instances(
        &self,
        id: ExecutionId,
        node: &FlowNode,
        characteristics: &LoopCharacteristics,
    ) -> Result<Resolved<(u64, Option<Vec<Value>>)>> {
        if let Some(expression) = &characteristics.loop_cardinality {
            let value = match self.evaluate(id, &node.id, expression)? {
                Resolved::Value(v) => v,
                Resolved::Raised(error) => return Ok(Resolved::Raised(error)),
            };
            let count = cardinality(&value).ok_or_else(|| ConfigError::InvalidCardinality {
                node: node.id.clone(),
                value: value.to_string(),
            })?;
            return Ok(Resolved::Value((count, None)));
        }

        let (value, source) = if let Some(collection) = &characteristics.collection {
            if is_expression(collection) {
                match self.evaluate(id, &node.id, collection)? {
                    Resolved::Value(v) => (v, collection),
                    Resolved::Raised(error) => return Ok(Resolved::Raised(error)),
                }
            } else {
                (self.variable_or_null(id, collection), collection)
            }
        } else if let Some(variable) = &characteristics.collection_variable {
            (self.variable_or_null(id, variable), variable)
        } else {
            return Err(ConfigError::Missing {
                node: node.id.clone(),
                what: "a loop cardinality or collection",
            }
            .into());
        };

        match value {
            Value::Array(items) => Ok(Resolved::Value((items.len() as u64, Some(items)))),
            other => Err(ConfigError::UnexpectedType {
                node: node.id.clone(),
                expression: source.clone(),
                expected: "a collection",
                found: type_name(&other).to_string(),
            }
            .into()),
        }
    }

    fn variable_or_null(&self, id: ExecutionId, name: &str) -> Value {
        self.tree.get_variable(id, name).unwrap_or(Value::Null)
    }

    /// Bind `loopCounter` and the element variable, then schedule the iteration.
    fn begin_iteration(
        &mut self,
        scope: ExecutionId,
        iteration: ExecutionId,
        node: &FlowNode,
        characteristics: &LoopCharacteristics,
        index: u64,
    ) -> Result<()> {
        self.tree
            .set_variable_local(iteration, LOOP_COUNTER, Value::from(index))?;
        if let Some(element) = &characteristics.element_variable {
            let item = self
                .tree
                .get(scope)?
                .loop_collection
                .as_ref()
                .and_then(|items| items.get(index as usize))
                .cloned()
                .unwrap_or(Value::Null);
            self.tree.set_variable_local(iteration, element, item)?;
        }
        tracing::debug!(
            execution = %iteration,
            node = %node.id,
            loop_counter = index,
            "Iteration started"
        );
        self.tree.record(RuntimeEvent::LoopIterationStarted {
            execution: iteration,
            node_id: node.id.clone(),
            loop_counter: index,
        });
        self.schedule(Operation::Execute(iteration));
        Ok(())
    }

    /// One iteration finished its inner behavior.
    pub(crate) fn complete_iteration(&mut self, iteration: ExecutionId) -> Result<Outcome> {
        let execution = self.tree.get(iteration)?;
        let node_id = execution
            .node_id
            .clone()
            .ok_or(Fault::InactiveExecution(iteration))?;
        let scope = execution.parent.ok_or(Fault::UnknownExecution(iteration))?;
        let def = self.tree.definition(iteration)?;
        let node = def.require_node(&node_id)?;
        let characteristics = node.multi_instance.as_ref().ok_or(ConfigError::Missing {
            node: node.id.clone(),
            what: "multi-instance characteristics",
        })?;

        let instances = self.loop_count(scope, NR_OF_INSTANCES);
        let completed = self.loop_count(scope, NR_OF_COMPLETED_INSTANCES) + 1;
        let active = self
            .loop_count(scope, NR_OF_ACTIVE_INSTANCES)
            .saturating_sub(1);
        self.tree
            .set_variable_local(scope, NR_OF_COMPLETED_INSTANCES, Value::from(completed))?;
        self.tree
            .set_variable_local(scope, NR_OF_ACTIVE_INSTANCES, Value::from(active))?;
        tracing::debug!(
            execution = %iteration,
            node = %node.id,
            completed,
            active,
            "Iteration completed"
        );
        self.tree.record(RuntimeEvent::LoopIterationCompleted {
            execution: iteration,
            node_id: node.id.clone(),
            nr_of_completed_instances: completed,
            nr_of_active_instances: active,
        });

        let early = match &characteristics.completion_condition {
            Some(condition) => resolve!(self.evaluate_bool(iteration, &node.id, condition)?),
            None => false,
        };

        if characteristics.sequential {
            if early || completed >= instances {
                return self.finish_loop(scope, node, early);
            }
            let next = self
                .tree
                .get_variable_local(iteration, LOOP_COUNTER)
                .and_then(|v| v.as_u64())
                .map_or(completed, |n| n + 1);
            self.tree.get_mut(iteration)?.state = ExecutionState::Active;
            self.tree
                .set_variable_local(scope, NR_OF_ACTIVE_INSTANCES, Value::from(1u64))?;
            self.begin_iteration(scope, iteration, node, characteristics, next)?;
            return Ok(Outcome::Continue);
        }

        self.tree.end_execution(iteration, EndReason::Completed);
        if early || completed >= instances {
            return self.finish_loop(scope, node, early);
        }
        Ok(Outcome::Continue)
    }

    fn loop_count(&self, scope: ExecutionId, name: &str) -> u64 {
        self.tree
            .get_variable_local(scope, name)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Tear down the loop scope and leave the multi-instance node as a whole.
    fn finish_loop(&mut self, scope: ExecutionId, node: &FlowNode, early: bool) -> Result<Outcome> {
        let owner = self
            .tree
            .get(scope)?
            .parent
            .ok_or(Fault::UnknownExecution(scope))?;
        let instances = self.loop_count(scope, NR_OF_INSTANCES);
        let completed = self.loop_count(scope, NR_OF_COMPLETED_INSTANCES);

        let cancelled = self
            .tree
            .destroy_descendants(scope, "multi-instance completion condition");
        self.tree.end_execution(scope, EndReason::Completed);
        self.tree.get_mut(owner)?.state = ExecutionState::Active;

        tracing::info!(
            execution = %owner,
            node = %node.id,
            completed,
            cancelled = cancelled.len(),
            early,
            "Multi-instance completed"
        );
        self.tree.record(RuntimeEvent::LoopCompleted {
            node_id: node.id.clone(),
            nr_of_instances: instances,
            nr_of_completed_instances: completed,
            early,
        });
        self.leave_ignoring_conditions(owner)
    }
}

/// Non-negative integer, integral float, or numeric string.
fn cardinality(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().and_then(integral)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<u64> {
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then(|| f as u64)
}

//! Call activities: start a separate process instance and resume the caller
//! when it ends.

use super::{Behavior, Dispatcher, Operation, Resolved};
use crate::error::{ConfigError, Fault, Outcome, Result};
use crate::events::RuntimeEvent;
use crate::expr::type_name;
use crate::model::{is_expression, DataAssociation, FlowNode};
use crate::types::*;

impl Dispatcher<'_> {
    pub(crate) fn start_call_activity(
        &mut self,
        id: ExecutionId,
        node: &FlowNode,
        called_element: &str,
        inputs: &[DataAssociation],
    ) -> Result<Outcome> {
        let process_key = if is_expression(called_element) {
            match resolve!(self.evaluate(id, &node.id, called_element)?) {
                Value::String(key) => key,
                other => {
                    return Err(ConfigError::UnexpectedType {
                        node: node.id.clone(),
                        expression: called_element.to_string(),
                        expected: "a process key string",
                        found: type_name(&other).to_string(),
                    }
                    .into())
                }
            }
        } else {
            called_element.to_string()
        };

        let definition = self
            .ctx
            .definitions
            .resolve_latest(&process_key)?
            .ok_or_else(|| ConfigError::DefinitionNotFound(process_key.clone()))?;

        let mut values = Vec::with_capacity(inputs.len());
        for association in inputs {
            let value = resolve!(self.association_value(id, &node.id, association)?);
            values.push((association.target.as_str(), value));
        }

        let sub_instance = self.tree.create_sub_instance(id, definition)?;
        for (target, value) in values {
            self.tree.set_variable_local(sub_instance, target, value)?;
        }

        tracing::info!(
            caller = %id,
            sub_instance = %sub_instance,
            process_key = %process_key,
            "Sub-process instance started"
        );
        self.tree.record(RuntimeEvent::SubProcessStarted {
            caller: id,
            sub_instance,
            process_key,
        });
        self.schedule(Operation::Execute(sub_instance));
        Ok(Outcome::Wait)
    }

    /// Value of one data association, read from the scope of `id`. A missing
    /// source variable reads as null.
    fn association_value(
        &self,
        id: ExecutionId,
        node_id: &str,
        association: &DataAssociation,
    ) -> Result<Resolved<Value>> {
        if let Some(expression) = &association.source_expression {
            return self.evaluate(id, node_id, expression);
        }
        let value = association
            .source
            .as_deref()
            .and_then(|name| self.tree.get_variable(id, name))
            .unwrap_or(Value::Null);
        Ok(Resolved::Value(value))
    }

    /// The called instance rooted at `sub_instance` ended: copy outputs, then leave.
    pub(crate) fn complete_call_activity(
        &mut self,
        caller: ExecutionId,
        sub_instance: ExecutionId,
    ) -> Result<Outcome> {
        tracing::debug!(
            caller = %caller,
            sub_instance = %sub_instance,
            "Sub-process instance completing"
        );
        self.tree.record(RuntimeEvent::SubProcessCompleting {
            caller,
            sub_instance,
        });
        match self.completing(caller, sub_instance)? {
            Outcome::Continue => self.completed(caller),
            raised => Ok(raised),
        }
    }

    /// Copies output associations into the caller. No control flow.
    fn completing(&mut self, caller: ExecutionId, sub_instance: ExecutionId) -> Result<Outcome> {
        let node_id = self
            .tree
            .get(caller)?
            .node_id
            .clone()
            .ok_or(Fault::InactiveExecution(caller))?;
        let def = self.tree.definition(caller)?;
        let node = def.require_node(&node_id)?;
        let Behavior::CallActivity { outputs, .. } = Behavior::unwrapped(&node.kind) else {
            return Err(ConfigError::Missing {
                node: node.id.clone(),
                what: "a call activity",
            }
            .into());
        };

        let mut values = Vec::with_capacity(outputs.len());
        for association in outputs {
            let value = resolve!(self.association_value(sub_instance, &node.id, association)?);
            values.push((association.target.as_str(), value));
        }
        for (target, value) in values {
            self.tree.set_variable(caller, target, value)?;
        }
        Ok(Outcome::Continue)
    }

    /// Control flow only: the caller leaves the call activity.
    fn completed(&mut self, caller: ExecutionId) -> Result<Outcome> {
        self.tree.get_mut(caller)?.sub_instance = None;
        tracing::info!(caller = %caller, "Sub-process instance completed");
        self.tree
            .record(RuntimeEvent::SubProcessCompleted { caller });
        self.leave(caller)
    }
}

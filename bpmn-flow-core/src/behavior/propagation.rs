//! Business error propagation: innermost-first search for a boundary error
//! event, crossing from called instances into their callers.

use super::{Dispatcher, Operation};
use crate::error::{BpmnError, Fault, Result};
use crate::events::RuntimeEvent;
use crate::model::{FlowNode, NodeKind};
use crate::types::*;

impl Dispatcher<'_> {
    pub(crate) fn propagate(&mut self, from: ExecutionId, error: BpmnError) -> Result<()> {
        tracing::debug!(execution = %from, code = %error.error_code, "Business error thrown");
        self.tree.record(RuntimeEvent::ErrorThrown {
            execution: from,
            error_code: error.error_code.clone(),
        });

        let mut current = Some(from);
        while let Some(id) = current {
            let execution = self.tree.get(id)?;
            let next = execution.parent.or(execution.super_execution);
            // Loop members share their node with the multi-instance owner, which catches for them.
            let candidate = matches!(
                execution.role,
                ExecutionRole::ProcessInstance | ExecutionRole::Branch
            ) && !execution.concurrent_root
                && !execution.is_ended();

            if let Some(node_id) = execution.node_id.clone().filter(|_| candidate) {
                let def = self.tree.definition(id)?;
                if let Some(boundary) = def.matching_boundary(&node_id, &error.error_code) {
                    return self.catch(id, boundary, &error);
                }
            }
            current = next;
        }

        self.terminate(&error)
    }

    /// `handler` owns the matching boundary event: cancel everything below it
    /// and execute the boundary node like any other.
    fn catch(
        &mut self,
        handler: ExecutionId,
        boundary: &FlowNode,
        error: &BpmnError,
    ) -> Result<()> {
        let cause = format!("business error '{}'", error.error_code);
        let destroyed = self.tree.destroy_descendants(handler, &cause);
        {
            let execution = self.tree.get_mut(handler)?;
            execution.state = ExecutionState::Active;
            execution.node_id = Some(boundary.id.clone());
        }
        if let NodeKind::BoundaryErrorEvent {
            error_code_variable: Some(variable),
            ..
        } = &boundary.kind
        {
            self.tree.set_variable(
                handler,
                variable,
                Value::String(error.error_code.clone()),
            )?;
        }

        tracing::info!(
            handler = %handler,
            boundary = %boundary.id,
            code = %error.error_code,
            destroyed = destroyed.len(),
            "Business error caught"
        );
        self.tree.record(RuntimeEvent::ErrorCaught {
            error_code: error.error_code.clone(),
            boundary_id: boundary.id.clone(),
            handler,
            destroyed,
        });

        self.schedule(Operation::Execute(handler));
        Ok(())
    }

    /// No handler anywhere: the whole instance is torn down.
    fn terminate(&mut self, error: &BpmnError) -> Result<()> {
        let root = self.tree.root();
        tracing::warn!(
            instance = %self.tree.instance_id(),
            code = %error.error_code,
            "Unhandled business error, terminating process instance"
        );
        self.tree.record(RuntimeEvent::ErrorUnhandled {
            error_code: error.error_code.clone(),
        });
        self.tree.end_execution(
            root,
            EndReason::Terminated {
                error_code: error.error_code.clone(),
            },
        );
        self.tree.set_process_state(ProcessState::Failed {
            error_code: error.error_code.clone(),
        });
        self.tree.record(RuntimeEvent::InstanceTerminated {
            instance: root,
            error_code: error.error_code.clone(),
        });
        self.agenda.clear();
        Err(Fault::UnhandledBusinessError {
            error_code: error.error_code.clone(),
            process_instance: self.tree.instance_id(),
        })
    }
}

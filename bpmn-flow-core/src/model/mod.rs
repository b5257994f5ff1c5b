//! Immutable process graph: flow nodes, transitions and behavior configuration.
//!
//! Produced by a loader (see [`yaml`]) and shared read-only between all
//! executions of a definition.

pub mod registry;
pub mod validate;
pub mod yaml;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !v
}

// ── Definition ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Node a new instance starts at.
    pub initial: String,
    pub nodes: Vec<FlowNode>,
}

impl ProcessDefinition {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn require_node(&self, id: &str) -> Result<&FlowNode, ConfigError> {
        self.node(id).ok_or_else(|| ConfigError::UnknownNode {
            node: id.to_string(),
            process: self.key.clone(),
        })
    }

    /// Boundary error events attached to `activity`, in declaration order.
    pub fn boundary_error_events<'a>(
        &'a self,
        activity: &'a str,
    ) -> impl Iterator<Item = (&'a FlowNode, Option<&'a str>)> + 'a {
        self.nodes.iter().filter_map(move |n| match &n.kind {
            NodeKind::BoundaryErrorEvent {
                attached_to,
                error_code,
                ..
            } if attached_to == activity => Some((n, error_code.as_deref())),
            _ => None,
        })
    }

    /// The boundary event catching `error_code` on `activity`: an exact code
    /// match wins over a catch-all.
    pub fn matching_boundary<'a>(
        &'a self,
        activity: &'a str,
        error_code: &str,
    ) -> Option<&'a FlowNode> {
        let mut catch_all = None;
        for (node, code) in self.boundary_error_events(activity) {
            match code {
                Some(code) if code == error_code => return Some(node),
                None if catch_all.is_none() => catch_all = Some(node),
                _ => {}
            }
        }
        catch_all
    }
}

// ── Nodes ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outgoing: Vec<Transition>,
    /// Enclosing embedded sub-process, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<LoopCharacteristics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub listeners: Vec<ListenerBinding>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            outgoing: Vec::new(),
            parent: None,
            multi_instance: None,
            listeners: Vec::new(),
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.outgoing.push(Transition::new(target));
        self
    }

    pub fn to_when(mut self, target: impl Into<String>, condition: impl Into<String>) -> Self {
        let mut transition = Transition::new(target);
        transition.condition = Some(condition.into());
        self.outgoing.push(transition);
        self
    }

    pub fn within(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn looped(mut self, characteristics: LoopCharacteristics) -> Self {
        self.multi_instance = Some(characteristics);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeKind {
    StartEvent,
    EndEvent,
    IntermediateEvent,
    Task,
    ServiceTask {
        handler: String,
    },
    ReceiveTask,
    UserTask,
    ExclusiveGateway,
    ParallelGateway,
    SubProcess {
        initial: String,
    },
    CallActivity {
        /// Process key, or an `${…}` expression resolving to one.
        called_element: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        inputs: Vec<DataAssociation>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<DataAssociation>,
    },
    ErrorEndEvent {
        error_code: String,
    },
    BoundaryErrorEvent {
        attached_to: String,
        /// `None` catches every error code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code_variable: Option<String>,
    },
}

impl NodeKind {
    /// Nodes that can own boundary events and multi-instance characteristics.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeKind::Task
                | NodeKind::ServiceTask { .. }
                | NodeKind::ReceiveTask
                | NodeKind::UserTask
                | NodeKind::SubProcess { .. }
                | NodeKind::CallActivity { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::StartEvent => "StartEvent",
            NodeKind::EndEvent => "EndEvent",
            NodeKind::IntermediateEvent => "IntermediateEvent",
            NodeKind::Task => "Task",
            NodeKind::ServiceTask { .. } => "ServiceTask",
            NodeKind::ReceiveTask => "ReceiveTask",
            NodeKind::UserTask => "UserTask",
            NodeKind::ExclusiveGateway => "ExclusiveGateway",
            NodeKind::ParallelGateway => "ParallelGateway",
            NodeKind::SubProcess { .. } => "SubProcess",
            NodeKind::CallActivity { .. } => "CallActivity",
            NodeKind::ErrorEndEvent { .. } => "ErrorEndEvent",
            NodeKind::BoundaryErrorEvent { .. } => "BoundaryErrorEvent",
        }
    }
}

// ── Transitions ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub target: String,
    /// Boolean expression; `None` is unconditional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Taken only when no other transition is.
    #[serde(default, skip_serializing_if = "is_false")]
    pub default: bool,
}

impl Transition {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            id: None,
            target: target.into(),
            condition: None,
            default: false,
        }
    }
}

// ── Behavior configuration ──

/// Multi-instance configuration. Exactly one instance source must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopCharacteristics {
    #[serde(default, skip_serializing_if = "is_false")]
    pub sequential: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_cardinality: Option<String>,
    /// Expression resolving to a collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Variable holding a collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

impl LoopCharacteristics {
    pub fn instance_sources(&self) -> usize {
        [
            self.loop_cardinality.is_some(),
            self.collection.is_some(),
            self.collection_variable.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Copies one value across a call-activity boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAssociation {
    /// Variable read from the source scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Expression evaluated against the source scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_expression: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerEvent {
    Start,
    End,
}

impl ListenerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerEvent::Start => "start",
            ListenerEvent::End => "end",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerBinding {
    pub event: ListenerEvent,
    pub listener: String,
}

/// `true` when `text` must go through the expression evaluator.
pub fn is_expression(text: &str) -> bool {
    text.contains("${") || text.contains("#{")
}

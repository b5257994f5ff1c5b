use super::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

struct Issues(Vec<ValidationIssue>);

impl Issues {
    fn error(&mut self, rule: &str, message: String) {
        self.0.push(ValidationIssue {
            severity: Severity::Error,
            rule: rule.to_string(),
            message,
        });
    }

    fn warning(&mut self, rule: &str, message: String) {
        self.0.push(ValidationIssue {
            severity: Severity::Warning,
            rule: rule.to_string(),
            message,
        });
    }
}

/// Validate a ProcessDefinition. Returns all issues found, errors and warnings.
pub fn validate_definition(def: &ProcessDefinition) -> Vec<ValidationIssue> {
    let mut issues = Issues(Vec::new());

    let mut by_id: HashMap<&str, &FlowNode> = HashMap::new();
    for node in &def.nodes {
        if by_id.insert(node.id.as_str(), node).is_some() {
            issues.error("duplicate_node_id", format!("Duplicate node id: {}", node.id));
        }
    }

    match by_id.get(def.initial.as_str()) {
        None => issues.error(
            "unknown_initial",
            format!("Initial node '{}' does not exist", def.initial),
        ),
        Some(node) if node.parent.is_some() => issues.error(
            "unknown_initial",
            format!("Initial node '{}' is nested in a sub-process", def.initial),
        ),
        Some(_) => {}
    }

    for node in &def.nodes {
        check_parent(node, &by_id, &mut issues);
        check_transitions(node, &by_id, &mut issues);
        check_kind(node, &by_id, &mut issues);
        if let Some(mi) = &node.multi_instance {
            check_loop(node, mi, &mut issues);
        }
    }

    // Reachability only makes sense once ids resolve.
    if !issues.0.iter().any(|i| i.severity == Severity::Error) {
        for id in unreachable_nodes(def) {
            issues.warning("unreachable_node", format!("Node '{}' is unreachable", id));
        }
    }

    issues.0
}

/// Only the errors, rendered one per line.
pub fn error_summary(issues: &[ValidationIssue]) -> Option<String> {
    let errors: Vec<String> = issues
        .iter()
        .filter(|i| i.severity == Severity::Error)
        .map(|i| i.to_string())
        .collect();
    (!errors.is_empty()).then(|| errors.join("\n"))
}

fn check_parent(node: &FlowNode, by_id: &HashMap<&str, &FlowNode>, issues: &mut Issues) {
    let Some(parent) = &node.parent else {
        return;
    };
    match by_id.get(parent.as_str()) {
        Some(p) if matches!(p.kind, NodeKind::SubProcess { .. }) => {}
        Some(_) => issues.error(
            "invalid_parent_scope",
            format!("Node '{}' names '{}' as parent, which is not a sub-process", node.id, parent),
        ),
        None => issues.error(
            "invalid_parent_scope",
            format!("Node '{}' names unknown parent '{}'", node.id, parent),
        ),
    }
}

fn check_transitions(node: &FlowNode, by_id: &HashMap<&str, &FlowNode>, issues: &mut Issues) {
    for transition in &node.outgoing {
        match by_id.get(transition.target.as_str()) {
            None => issues.error(
                "dangling_transition",
                format!("Transition {} -> {} targets an unknown node", node.id, transition.target),
            ),
            Some(target) if target.parent != node.parent => issues.error(
                "cross_scope_transition",
                format!("Transition {} -> {} crosses a sub-process boundary", node.id, target.id),
            ),
            Some(target) if matches!(target.kind, NodeKind::BoundaryErrorEvent { .. }) => issues
                .error(
                    "transition_into_boundary",
                    format!("Transition {} -> {} targets a boundary event", node.id, target.id),
                ),
            Some(_) => {}
        }
    }

    let defaults = node.outgoing.iter().filter(|t| t.default).count();
    if defaults > 1 {
        issues.error(
            "multiple_default_flows",
            format!("Node '{}' has {} default transitions", node.id, defaults),
        );
    }
    if node.outgoing.iter().any(|t| t.default && t.condition.is_some()) {
        issues.warning(
            "conditional_default_flow",
            format!(
                "Default transition on '{}' carries a condition that is never evaluated",
                node.id
            ),
        );
    }
}

fn check_kind(node: &FlowNode, by_id: &HashMap<&str, &FlowNode>, issues: &mut Issues) {
    match &node.kind {
        NodeKind::SubProcess { initial } => match by_id.get(initial.as_str()) {
            Some(start) if start.parent.as_deref() == Some(node.id.as_str()) => {}
            Some(_) => issues.error(
                "sub_process_initial",
                format!("Initial node '{}' of sub-process '{}' is not inside it", initial, node.id),
            ),
            None => issues.error(
                "sub_process_initial",
                format!("Sub-process '{}' starts at unknown node '{}'", node.id, initial),
            ),
        },
        NodeKind::CallActivity {
            called_element,
            inputs,
            outputs,
        } => {
            if called_element.trim().is_empty() {
                issues.error(
                    "empty_called_element",
                    format!("Call activity '{}' has no called element", node.id),
                );
            }
            for association in inputs.iter().chain(outputs) {
                if association.source.is_some() && association.source_expression.is_some() {
                    issues.error(
                        "data_association_source",
                        format!(
                            "Data association '{}' on '{}' sets both source and source_expression",
                            association.target, node.id
                        ),
                    );
                }
            }
        }
        NodeKind::BoundaryErrorEvent { attached_to, .. } => match by_id.get(attached_to.as_str()) {
            Some(activity) if !activity.kind.is_activity() => issues.error(
                "boundary_attachment",
                format!(
                    "Boundary event '{}' is attached to {} '{}'",
                    node.id,
                    activity.kind.name(),
                    attached_to
                ),
            ),
            Some(activity) if activity.parent != node.parent => issues.error(
                "boundary_attachment",
                format!("Boundary event '{}' is not in the scope of '{}'", node.id, attached_to),
            ),
            Some(_) => {}
            None => issues.error(
                "boundary_attachment",
                format!(
                    "Boundary event '{}' is attached to unknown node '{}'",
                    node.id, attached_to
                ),
            ),
        },
        NodeKind::ErrorEndEvent { error_code } if error_code.trim().is_empty() => issues.error(
            "empty_error_code",
            format!("Error end event '{}' has an empty error code", node.id),
        ),
        _ => {}
    }
}

fn check_loop(node: &FlowNode, mi: &LoopCharacteristics, issues: &mut Issues) {
    if !node.kind.is_activity() {
        issues.error(
            "loop_on_non_activity",
            format!("{} '{}' cannot be multi-instance", node.kind.name(), node.id),
        );
    }
    let sources = mi.instance_sources();
    if sources != 1 {
        issues.error(
            "loop_instance_source",
            format!(
                "Multi-instance '{}' needs exactly one of loop_cardinality, collection, \
                 collection_variable (found {})",
                node.id, sources
            ),
        );
    }
    if mi.element_variable.is_some() && mi.loop_cardinality.is_some() {
        issues.error(
            "element_without_collection",
            format!("Multi-instance '{}' binds an element variable without a collection", node.id),
        );
    }
}

/// Nodes no path reaches from the initial node. Edges are transitions, activity
/// to attached boundary event, and sub-process to its initial node.
fn unreachable_nodes(def: &ProcessDefinition) -> Vec<String> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for node in &def.nodes {
        index.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    for node in &def.nodes {
        let from = index[node.id.as_str()];
        for transition in &node.outgoing {
            if let Some(&to) = index.get(transition.target.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
        match &node.kind {
            NodeKind::SubProcess { initial } => {
                if let Some(&to) = index.get(initial.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
            NodeKind::BoundaryErrorEvent { attached_to, .. } => {
                if let Some(&activity) = index.get(attached_to.as_str()) {
                    graph.add_edge(activity, from, ());
                }
            }
            _ => {}
        }
    }

    let Some(&start) = index.get(def.initial.as_str()) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut dfs = Dfs::new(&graph, start);
    while let Some(ix) = dfs.next(&graph) {
        seen.insert(ix);
    }

    def.nodes
        .iter()
        .filter(|n| !seen.contains(&index[n.id.as_str()]))
        .map(|n| n.id.clone())
        .collect()
}

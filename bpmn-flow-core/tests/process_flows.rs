//! End-to-end flows through the engine facade: definitions deployed as YAML,
//! instances driven through start / signal / leave.

use bpmn_flow_core::{
    BpmnError, Collaborators, DefaultEvaluator, EndReason, Engine, EngineConfig, ExecutionId,
    ExecutionRole, ExecutionState, ExecutionTree, ExpressionError, ExpressionEvaluator, Fault,
    HandlerError, ListenerRegistry, MemoryDefinitionCache, ProcessState, RuntimeEvent,
    ServiceRegistry, Value, VariableScope, Variables, NR_OF_ACTIVE_INSTANCES,
    NR_OF_COMPLETED_INSTANCES, NR_OF_INSTANCES,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

// ── Helpers ──

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn cache_with(yamls: &[&str]) -> Arc<MemoryDefinitionCache> {
    init_tracing();
    let cache = Arc::new(MemoryDefinitionCache::new());
    for yaml in yamls {
        cache.deploy_yaml(yaml).unwrap();
    }
    cache
}

fn engine(yamls: &[&str]) -> Engine {
    Engine::new(Collaborators::new(cache_with(yamls)), EngineConfig::default())
}

fn engine_with_services(yamls: &[&str], services: ServiceRegistry) -> Engine {
    let collaborators = Collaborators::new(cache_with(yamls)).with_services(services);
    Engine::new(collaborators, EngineConfig::default())
}

fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Variables::new(),
    }
}

fn signal_node(engine: &Engine, tree: &mut ExecutionTree, node: &str, payload: Value) {
    let id = tree
        .find_active_execution(node)
        .unwrap_or_else(|| panic!("no active execution at {}", node));
    engine.signal(tree, id, None, payload).unwrap();
}

fn recorded<F: Fn(&RuntimeEvent) -> bool>(tree: &ExecutionTree, pred: F) -> usize {
    tree.events().iter().filter(|(_, e)| pred(e)).count()
}

// ── Sequential flow and waits ──

const APPROVAL: &str = r#"
key: approval
initial: start
nodes:
  - id: start
    kind: StartEvent
    outgoing:
      - target: review
  - id: review
    kind: UserTask
    outgoing:
      - target: end
  - id: end
    kind: EndEvent
"#;

#[test]
fn test_wait_state_parks_until_signalled() {
    let engine = engine(&[APPROVAL]);
    let mut tree = engine
        .start_process_instance("approval", Variables::new())
        .unwrap();

    assert_eq!(tree.process_state(), &ProcessState::Running);
    assert_eq!(tree.active_node_ids(), vec!["review".to_string()]);

    signal_node(&engine, &mut tree, "review", json!({"approved": true}));

    assert_eq!(tree.process_state(), &ProcessState::Completed);
    assert!(tree.active_node_ids().is_empty());
    assert_eq!(tree.get_variable(tree.root(), "approved"), Some(json!(true)));
}

#[test]
fn test_signal_on_completed_instance_is_rejected() {
    let engine = engine(&[APPROVAL]);
    let mut tree = engine
        .start_process_instance("approval", Variables::new())
        .unwrap();
    let id = tree.find_active_execution("review").unwrap();
    engine.signal(&mut tree, id, None, Value::Null).unwrap();

    let err = engine.signal(&mut tree, id, None, Value::Null).unwrap_err();
    assert!(matches!(err, Fault::InstanceNotRunning(_)));
}

#[test]
fn test_signal_payload_must_be_object() {
    let engine = engine(&[APPROVAL]);
    let mut tree = engine
        .start_process_instance("approval", Variables::new())
        .unwrap();
    let id = tree.find_active_execution("review").unwrap();

    let err = engine.signal(&mut tree, id, None, json!([1, 2])).unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_start_twice_is_rejected() {
    let engine = engine(&[APPROVAL]);
    let mut tree = engine
        .create_process_instance("approval", Variables::new())
        .unwrap();
    engine.start(&mut tree).unwrap();
    assert!(matches!(
        engine.start(&mut tree).unwrap_err(),
        Fault::AlreadyStarted(_)
    ));
}

#[test]
fn test_unknown_process_key() {
    let engine = engine(&[APPROVAL]);
    let err = engine
        .start_process_instance("missing", Variables::new())
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_leave_moves_a_waiting_token_on() {
    let engine = engine(&[APPROVAL]);
    let mut tree = engine
        .start_process_instance("approval", Variables::new())
        .unwrap();
    let id = tree.find_active_execution("review").unwrap();
    engine.leave(&mut tree, id).unwrap();
    assert_eq!(tree.process_state(), &ProcessState::Completed);
}

// ── Gateways ──

const ROUTING: &str = r#"
key: routing
initial: gw
nodes:
  - id: gw
    kind: ExclusiveGateway
    outgoing:
      - target: big
        condition: "${amount > 100}"
      - target: medium
        condition: "${amount > 10}"
      - target: small
        default: true
  - id: big
    kind: UserTask
  - id: medium
    kind: UserTask
  - id: small
    kind: UserTask
"#;

#[test]
fn test_exclusive_gateway_takes_first_true_condition() {
    let engine = engine(&[ROUTING]);
    let tree = engine
        .start_process_instance("routing", vars(json!({"amount": 500})))
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["big".to_string()]);

    let tree = engine
        .start_process_instance("routing", vars(json!({"amount": 50})))
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["medium".to_string()]);
}

#[test]
fn test_exclusive_gateway_falls_back_to_default() {
    let engine = engine(&[ROUTING]);
    let tree = engine
        .start_process_instance("routing", vars(json!({"amount": 1})))
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["small".to_string()]);
}

#[test]
fn test_non_boolean_condition_is_a_configuration_error() {
    let engine = engine(&[ROUTING]);
    let err = engine
        .start_process_instance("routing", vars(json!({"amount": "lots"})))
        .unwrap_err();
    assert!(err.is_configuration());
}

const FAN_OUT: &str = r#"
key: fan_out
initial: split
nodes:
  - id: split
    kind: ParallelGateway
    outgoing:
      - target: a
      - target: b
  - id: a
    kind: ReceiveTask
  - id: b
    kind: ReceiveTask
"#;

#[test]
fn test_parallel_gateway_forks_concurrent_children() {
    let engine = engine(&[FAN_OUT]);
    let mut tree = engine
        .start_process_instance("fan_out", Variables::new())
        .unwrap();

    let root = tree.execution(tree.root()).unwrap();
    assert!(root.concurrent_root);
    assert_eq!(root.state, ExecutionState::Scope);
    assert_eq!(root.node_id, None);
    assert_eq!(tree.children(tree.root()).len(), 2);
    for child in tree.children(tree.root()) {
        let child = tree.execution(*child).unwrap();
        assert!(child.concurrent);
        assert_eq!(child.role, ExecutionRole::Branch);
    }

    signal_node(&engine, &mut tree, "a", Value::Null);
    assert_eq!(tree.process_state(), &ProcessState::Running);
    assert_eq!(tree.active_node_ids(), vec!["b".to_string()]);

    signal_node(&engine, &mut tree, "b", Value::Null);
    assert_eq!(tree.process_state(), &ProcessState::Completed);
}

const INCLUSIVE: &str = r#"
key: inclusive
initial: task
nodes:
  - id: task
    kind: Task
    outgoing:
      - target: a
        condition: "${x > 0}"
      - target: b
        condition: "${x > 5}"
  - id: a
    kind: ReceiveTask
  - id: b
    kind: ReceiveTask
"#;

#[test]
fn test_all_true_conditions_are_taken() {
    let engine = engine(&[INCLUSIVE]);
    let tree = engine
        .start_process_instance("inclusive", vars(json!({"x": 10})))
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn test_no_true_condition_ends_the_token() {
    let engine = engine(&[INCLUSIVE]);
    let tree = engine
        .start_process_instance("inclusive", vars(json!({"x": -1})))
        .unwrap();
    assert_eq!(tree.process_state(), &ProcessState::Completed);
    let root = tree.execution(tree.root()).unwrap();
    assert_eq!(
        root.end_reason,
        Some(bpmn_flow_core::EndReason::NoTransitionTaken)
    );
}

// ── Service tasks ──

const CHARGE: &str = r#"
key: charge
initial: charge
nodes:
  - id: charge
    kind: ServiceTask
    handler: charge_card
    outgoing:
      - target: done
  - id: done
    kind: EndEvent
"#;

#[test]
fn test_service_handler_writes_variables() {
    let mut services = ServiceRegistry::new();
    services.register_fn("charge_card", |execution| {
        let amount = execution
            .get_variable("amount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        execution
            .set_variable("charged", amount * 2)
            .map_err(|e| HandlerError::Failed(e.into()))?;
        Ok(())
    });
    let engine = engine_with_services(&[CHARGE], services);
    let tree = engine
        .start_process_instance("charge", vars(json!({"amount": 21})))
        .unwrap();

    assert_eq!(tree.process_state(), &ProcessState::Completed);
    assert_eq!(tree.get_variable(tree.root(), "charged"), Some(json!(42)));
}

#[test]
fn test_missing_service_handler_is_a_configuration_error() {
    let engine = engine(&[CHARGE]);
    let err = engine
        .start_process_instance("charge", Variables::new())
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_failing_handler_aborts_without_propagation() {
    let mut services = ServiceRegistry::new();
    services.register_fn("charge_card", |_execution| {
        Err(HandlerError::Failed(anyhow::anyhow!("gateway down")))
    });
    let engine = engine_with_services(&[CHARGE], services);
    let mut tree = engine
        .create_process_instance("charge", Variables::new())
        .unwrap();

    let err = engine.start(&mut tree).unwrap_err();
    assert!(matches!(err, Fault::Handler { .. }));
    assert_eq!(recorded(&tree, |e| matches!(e, RuntimeEvent::ErrorThrown { .. })), 0);
}

// ── Error propagation ──

const GUARDED: &str = r#"
key: guarded
initial: charge
nodes:
  - id: charge
    kind: ServiceTask
    handler: charge_card
    outgoing:
      - target: done
  - id: declined
    kind: BoundaryErrorEvent
    attached_to: charge
    error_code: CARD_DECLINED
    error_code_variable: failure
    outgoing:
      - target: manual
  - id: any_error
    kind: BoundaryErrorEvent
    attached_to: charge
    outgoing:
      - target: fallback
  - id: manual
    kind: UserTask
  - id: fallback
    kind: UserTask
  - id: done
    kind: EndEvent
"#;

fn raising(code: &'static str) -> ServiceRegistry {
    let mut services = ServiceRegistry::new();
    services.register_fn("charge_card", move |_execution| {
        Err(HandlerError::Business(BpmnError::new(code)))
    });
    services
}

#[test]
fn test_exact_error_code_beats_catch_all() {
    let engine = engine_with_services(&[GUARDED], raising("CARD_DECLINED"));
    let tree = engine
        .start_process_instance("guarded", Variables::new())
        .unwrap();

    assert_eq!(tree.active_node_ids(), vec!["manual".to_string()]);
    assert_eq!(
        tree.get_variable(tree.root(), "failure"),
        Some(json!("CARD_DECLINED"))
    );
}

#[test]
fn test_catch_all_boundary_handles_other_codes() {
    let engine = engine_with_services(&[GUARDED], raising("TIMEOUT"));
    let tree = engine
        .start_process_instance("guarded", Variables::new())
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["fallback".to_string()]);
    assert_eq!(tree.get_variable(tree.root(), "failure"), None);
}

const NESTED_ERROR: &str = r#"
key: nested_error
initial: work
nodes:
  - id: work
    kind: SubProcess
    initial: split
    outgoing:
      - target: done
  - id: split
    kind: ParallelGateway
    parent: work
    outgoing:
      - target: waiting
      - target: failing
  - id: waiting
    kind: ReceiveTask
    parent: work
  - id: failing
    kind: ErrorEndEvent
    error_code: BROKEN
    parent: work
  - id: recover
    kind: BoundaryErrorEvent
    attached_to: work
    error_code: BROKEN
    outgoing:
      - target: repair
  - id: repair
    kind: UserTask
  - id: done
    kind: EndEvent
"#;

#[test]
fn test_error_in_sub_process_destroys_siblings() {
    let engine = engine(&[NESTED_ERROR]);
    let tree = engine
        .start_process_instance("nested_error", Variables::new())
        .unwrap();

    assert_eq!(tree.active_node_ids(), vec!["repair".to_string()]);
    let destroyed = tree
        .events()
        .iter()
        .find_map(|(_, e)| match e {
            RuntimeEvent::ErrorCaught {
                boundary_id,
                destroyed,
                ..
            } if boundary_id == "recover" => Some(destroyed.clone()),
            _ => None,
        })
        .unwrap();
    assert!(!destroyed.is_empty());
    assert!(tree
        .executions()
        .filter(|e| e.node_id.as_deref() == Some("waiting"))
        .all(|e| e.is_ended()));
}

const UNGUARDED: &str = r#"
key: unguarded
initial: wait
nodes:
  - id: wait
    kind: ReceiveTask
    outgoing:
      - target: fail
  - id: fail
    kind: ErrorEndEvent
    error_code: FATAL
"#;

#[test]
fn test_unhandled_error_terminates_the_instance() {
    let engine = engine(&[UNGUARDED]);
    let mut tree = engine
        .start_process_instance("unguarded", Variables::new())
        .unwrap();
    let id = tree.find_active_execution("wait").unwrap();

    let err = engine.signal(&mut tree, id, None, Value::Null).unwrap_err();
    assert!(err.is_business());
    assert_eq!(
        tree.process_state(),
        &ProcessState::Failed {
            error_code: "FATAL".into()
        }
    );
    assert!(tree.executions().all(|e| e.is_ended()));
    assert_eq!(
        recorded(&tree, |e| matches!(e, RuntimeEvent::InstanceTerminated { .. })),
        1
    );
}

// ── Embedded sub-process ──

const EMBEDDED: &str = r#"
key: embedded
initial: sub
nodes:
  - id: sub
    kind: SubProcess
    initial: inner
    outgoing:
      - target: after
  - id: inner
    kind: UserTask
    parent: sub
  - id: after
    kind: UserTask
"#;

#[test]
fn test_embedded_sub_process_completes_its_scope() {
    let engine = engine(&[EMBEDDED]);
    let mut tree = engine
        .start_process_instance("embedded", Variables::new())
        .unwrap();

    let root = tree.execution(tree.root()).unwrap();
    assert_eq!(root.state, ExecutionState::Scope);
    assert_eq!(tree.active_node_ids(), vec!["inner".to_string()]);

    signal_node(&engine, &mut tree, "inner", json!({"note": "ok"}));
    assert_eq!(tree.active_node_ids(), vec!["after".to_string()]);
    assert_eq!(tree.get_variable(tree.root(), "note"), Some(json!("ok")));
}

const DEEP_ERROR: &str = r#"
key: deep_error
initial: split
nodes:
  - id: split
    kind: ParallelGateway
    outgoing:
      - target: outer
      - target: side
  - id: side
    kind: UserTask
  - id: outer
    kind: SubProcess
    initial: mid
    outgoing:
      - target: done
  - id: mid
    kind: SubProcess
    initial: inner
    parent: outer
  - id: inner
    kind: SubProcess
    initial: inner_split
    parent: mid
  - id: inner_split
    kind: ParallelGateway
    parent: inner
    outgoing:
      - target: inner_wait
      - target: inner_fail
  - id: inner_wait
    kind: ReceiveTask
    parent: inner
  - id: inner_fail
    kind: ErrorEndEvent
    error_code: DEEP
    parent: inner
  - id: outer_failed
    kind: BoundaryErrorEvent
    attached_to: outer
    error_code: DEEP
    outgoing:
      - target: handled
  - id: handled
    kind: UserTask
  - id: done
    kind: EndEvent
"#;

#[test]
fn test_error_three_scopes_deep_is_caught_two_scopes_up() {
    let engine = engine(&[DEEP_ERROR]);
    let tree = engine
        .start_process_instance("deep_error", Variables::new())
        .unwrap();

    assert_eq!(
        tree.active_node_ids(),
        vec!["handled".to_string(), "side".to_string()]
    );
    let handler = tree.find_active_execution("handled").unwrap();
    let side = tree.find_active_execution("side").unwrap();
    let root = tree.root();

    let (caught_by, mut destroyed) = tree
        .events()
        .iter()
        .find_map(|(_, e)| match e {
            RuntimeEvent::ErrorCaught {
                boundary_id,
                handler,
                destroyed,
                ..
            } if boundary_id == "outer_failed" => Some((*handler, destroyed.clone())),
            _ => None,
        })
        .unwrap();
    assert_eq!(caught_by, handler);

    // Everything below the handler: mid, inner, the inner fork root and both inner tokens.
    let mut below: Vec<ExecutionId> = tree
        .executions()
        .map(|e| e.id)
        .filter(|id| ![root, handler, side].contains(id))
        .collect();
    destroyed.sort();
    below.sort();
    assert_eq!(below.len(), 5);
    assert_eq!(destroyed, below);
    for id in &destroyed {
        assert!(matches!(
            tree.execution(*id).unwrap().end_reason,
            Some(EndReason::Destroyed { .. })
        ));
    }

    // Outside the handler nothing moved.
    let side_branch = tree.execution(side).unwrap();
    assert_eq!(side_branch.state, ExecutionState::Active);
    assert_eq!(side_branch.end_reason, None);
    assert!(tree.execution(root).unwrap().concurrent_root);
    assert!(!tree.execution(root).unwrap().is_ended());
    assert_eq!(tree.process_state(), &ProcessState::Running);
}

// ── Call activity ──

const PARENT: &str = r#"
key: parent
initial: call
nodes:
  - id: call
    kind: CallActivity
    called_element: child
    inputs:
      - source: order
        target: order_in
      - source_expression: "${amount * 2}"
        target: doubled
    outputs:
      - source: result
        target: child_result
    outgoing:
      - target: after
  - id: after
    kind: UserTask
"#;

const CHILD: &str = r#"
key: child
initial: work
nodes:
  - id: work
    kind: UserTask
    outgoing:
      - target: end
  - id: end
    kind: EndEvent
"#;

#[test]
fn test_call_activity_maps_inputs_and_outputs() {
    let engine = engine(&[PARENT, CHILD]);
    let mut tree = engine
        .start_process_instance("parent", vars(json!({"order": "o-1", "amount": 4})))
        .unwrap();

    let caller = tree.find_active_execution("call").unwrap();
    let sub = tree.execution(caller).unwrap().sub_instance.unwrap();
    let sub_root = tree.execution(sub).unwrap();
    assert_eq!(sub_root.super_execution, Some(caller));
    assert_eq!(sub_root.parent, None);
    assert_eq!(tree.get_variable(sub, "order_in"), Some(json!("o-1")));
    assert_eq!(tree.get_variable(sub, "doubled"), Some(json!(8)));
    // Called instances do not see the caller's variables.
    assert_eq!(tree.get_variable(sub, "order"), None);

    signal_node(&engine, &mut tree, "work", json!({"result": "shipped"}));

    assert_eq!(tree.active_node_ids(), vec!["after".to_string()]);
    assert_eq!(
        tree.get_variable(tree.root(), "child_result"),
        Some(json!("shipped"))
    );
    assert_eq!(tree.execution(caller).unwrap().sub_instance, None);
}

const FAILING_CHILD: &str = r#"
key: child
initial: fail
nodes:
  - id: fail
    kind: ErrorEndEvent
    error_code: CHILD_FAILED
"#;

const GUARDED_PARENT: &str = r#"
key: parent
initial: call
nodes:
  - id: call
    kind: CallActivity
    called_element: child
    outgoing:
      - target: after
  - id: caught
    kind: BoundaryErrorEvent
    attached_to: call
    error_code: CHILD_FAILED
    outgoing:
      - target: compensate
  - id: compensate
    kind: UserTask
  - id: after
    kind: UserTask
"#;

#[test]
fn test_error_in_called_instance_reaches_caller_boundary() {
    let engine = engine(&[GUARDED_PARENT, FAILING_CHILD]);
    let tree = engine
        .start_process_instance("parent", Variables::new())
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["compensate".to_string()]);
    assert_eq!(tree.process_state(), &ProcessState::Running);
}

#[test]
fn test_call_activity_to_unknown_process_fails() {
    let engine = engine(&[PARENT]);
    let err = engine
        .start_process_instance("parent", Variables::new())
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn test_missing_input_source_arrives_as_null() {
    let engine = engine(&[PARENT, CHILD]);
    let tree = engine
        .start_process_instance("parent", vars(json!({"amount": 1})))
        .unwrap();
    let caller = tree.find_active_execution("call").unwrap();
    let sub = tree.execution(caller).unwrap().sub_instance.unwrap();
    assert_eq!(tree.get_variable_local(sub, "order_in"), Some(Value::Null));
    assert_eq!(tree.get_variable(sub, "doubled"), Some(json!(2)));
}

#[test]
fn test_leaving_a_call_activity_cancels_the_called_instance() {
    let engine = engine(&[PARENT, CHILD]);
    let mut tree = engine
        .start_process_instance("parent", vars(json!({"order": "o-2", "amount": 1})))
        .unwrap();
    let caller = tree.find_active_execution("call").unwrap();
    let sub = tree.execution(caller).unwrap().sub_instance.unwrap();
    let work = tree.find_active_execution("work").unwrap();

    engine.leave(&mut tree, caller).unwrap();

    assert_eq!(tree.active_node_ids(), vec!["after".to_string()]);
    assert_eq!(tree.execution(caller).unwrap().sub_instance, None);
    assert!(matches!(
        tree.execution(sub).unwrap().end_reason,
        Some(EndReason::Destroyed { .. })
    ));
    assert!(matches!(
        engine.signal(&mut tree, work, None, Value::Null).unwrap_err(),
        Fault::InactiveExecution(_)
    ));
    assert_eq!(tree.get_variable(tree.root(), "child_result"), None);
    assert_eq!(tree.process_state(), &ProcessState::Running);
}

#[test]
fn test_executing_a_waiting_call_activity_again_is_rejected() {
    let engine = engine(&[PARENT, CHILD]);
    let mut tree = engine
        .start_process_instance("parent", vars(json!({"order": "o-3", "amount": 1})))
        .unwrap();
    let caller = tree.find_active_execution("call").unwrap();
    let sub = tree.execution(caller).unwrap().sub_instance.unwrap();
    let before = tree.executions().count();

    let err = engine.execute(&mut tree, caller).unwrap_err();
    assert!(matches!(
        err,
        Fault::SubInstanceActive { execution, sub_instance, .. }
            if execution == caller && sub_instance == sub
    ));
    assert_eq!(
        tree.active_node_ids(),
        vec!["call".to_string(), "work".to_string()]
    );
    assert_eq!(tree.executions().count(), before);

    // The original called instance still resumes the caller.
    signal_node(&engine, &mut tree, "work", json!({"result": "packed"}));
    assert_eq!(tree.active_node_ids(), vec!["after".to_string()]);
    assert_eq!(
        tree.get_variable(tree.root(), "child_result"),
        Some(json!("packed"))
    );
}

#[test]
fn test_call_activity_does_not_accept_signals() {
    let engine = engine(&[PARENT, CHILD]);
    let mut tree = engine
        .start_process_instance("parent", vars(json!({"order": "o-4", "amount": 1})))
        .unwrap();
    let caller = tree.find_active_execution("call").unwrap();
    let sub = tree.execution(caller).unwrap().sub_instance;
    let journal = tree.events().len();

    let err = engine
        .signal(&mut tree, caller, None, json!({"x": 1}))
        .unwrap_err();
    assert!(matches!(
        err,
        Fault::UnsupportedSignal { execution, ref node } if execution == caller && node == "call"
    ));
    assert_eq!(
        tree.active_node_ids(),
        vec!["call".to_string(), "work".to_string()]
    );
    assert_eq!(tree.execution(caller).unwrap().sub_instance, sub);
    assert_eq!(tree.get_variable(caller, "x"), None);
    assert_eq!(tree.events().len(), journal);
}

const LOOPED_CALL: &str = r#"
key: looped_call
initial: call
nodes:
  - id: call
    kind: CallActivity
    called_element: child
    multi_instance:
      loop_cardinality: "2"
    outgoing:
      - target: after
  - id: after
    kind: UserTask
"#;

#[test]
fn test_looped_call_activity_iteration_rejects_signals() {
    let engine = engine(&[LOOPED_CALL, CHILD]);
    let mut tree = engine
        .start_process_instance("looped_call", Variables::new())
        .unwrap();
    let iteration = tree.find_active_execution("call").unwrap();
    assert_eq!(
        tree.execution(iteration).unwrap().role,
        ExecutionRole::LoopIteration
    );

    let err = engine
        .signal(&mut tree, iteration, None, Value::Null)
        .unwrap_err();
    assert!(matches!(err, Fault::UnsupportedSignal { execution, .. } if execution == iteration));

    let mut active = tree.active_node_ids();
    active.sort();
    assert_eq!(active, vec!["call", "call", "work", "work"]);

    for _ in 0..2 {
        signal_node(&engine, &mut tree, "work", Value::Null);
    }
    assert_eq!(tree.active_node_ids(), vec!["after".to_string()]);
}

// ── Multi-instance ──

const PARALLEL_REVIEW: &str = r#"
key: parallel_review
initial: review
nodes:
  - id: review
    kind: UserTask
    multi_instance:
      collection_variable: reviewers
      element_variable: reviewer
    outgoing:
      - target: done
  - id: done
    kind: UserTask
"#;

fn loop_scope(tree: &ExecutionTree) -> bpmn_flow_core::ExecutionId {
    tree.executions()
        .find(|e| e.role == ExecutionRole::LoopScope && !e.is_ended())
        .map(|e| e.id)
        .unwrap()
}

#[test]
fn test_parallel_multi_instance_binds_elements() {
    let engine = engine(&[PARALLEL_REVIEW]);
    let mut tree = engine
        .start_process_instance(
            "parallel_review",
            vars(json!({"reviewers": ["ann", "bob", "cid"]})),
        )
        .unwrap();

    let scope = loop_scope(&tree);
    assert_eq!(tree.get_variable_local(scope, NR_OF_INSTANCES), Some(json!(3)));
    assert_eq!(
        tree.get_variable_local(scope, NR_OF_ACTIVE_INSTANCES),
        Some(json!(3))
    );
    let iterations: Vec<_> = tree.children(scope).to_vec();
    assert_eq!(iterations.len(), 3);
    let reviewers: Vec<Value> = iterations
        .iter()
        .map(|i| tree.get_variable_local(*i, "reviewer").unwrap())
        .collect();
    assert_eq!(reviewers, vec![json!("ann"), json!("bob"), json!("cid")]);

    for _ in 0..3 {
        signal_node(&engine, &mut tree, "review", Value::Null);
    }
    assert_eq!(tree.active_node_ids(), vec!["done".to_string()]);
    let completed = tree.events().iter().find_map(|(_, e)| match e {
        RuntimeEvent::LoopCompleted {
            nr_of_completed_instances,
            early,
            ..
        } => Some((*nr_of_completed_instances, *early)),
        _ => None,
    });
    assert_eq!(completed, Some((3, false)));
}

const SEQUENTIAL_APPROVAL: &str = r#"
key: sequential_approval
initial: approve
nodes:
  - id: approve
    kind: UserTask
    multi_instance:
      sequential: true
      loop_cardinality: "3"
      completion_condition: "${rejected == true}"
    outgoing:
      - target: done
  - id: done
    kind: UserTask
"#;

#[test]
fn test_sequential_multi_instance_runs_one_at_a_time() {
    let engine = engine(&[SEQUENTIAL_APPROVAL]);
    let mut tree = engine
        .start_process_instance("sequential_approval", vars(json!({"rejected": false})))
        .unwrap();

    let scope = loop_scope(&tree);
    for expected_counter in 0..3u64 {
        assert_eq!(tree.active_node_ids(), vec!["approve".to_string()]);
        let iteration = tree.find_active_execution("approve").unwrap();
        assert_eq!(
            tree.get_variable_local(iteration, "loopCounter"),
            Some(json!(expected_counter))
        );
        assert_eq!(
            tree.get_variable_local(scope, NR_OF_COMPLETED_INSTANCES),
            Some(json!(expected_counter))
        );
        engine.signal(&mut tree, iteration, None, Value::Null).unwrap();
    }
    assert_eq!(tree.active_node_ids(), vec!["done".to_string()]);
}

#[test]
fn test_completion_condition_ends_loop_early() {
    let engine = engine(&[SEQUENTIAL_APPROVAL]);
    let mut tree = engine
        .start_process_instance("sequential_approval", vars(json!({"rejected": false})))
        .unwrap();

    signal_node(&engine, &mut tree, "approve", json!({"rejected": true}));

    assert_eq!(tree.active_node_ids(), vec!["done".to_string()]);
    let early = tree.events().iter().any(|(_, e)| {
        matches!(
            e,
            RuntimeEvent::LoopCompleted {
                early: true,
                nr_of_completed_instances: 1,
                ..
            }
        )
    });
    assert!(early);
}

#[test]
fn test_empty_collection_skips_the_activity() {
    let engine = engine(&[PARALLEL_REVIEW]);
    let tree = engine
        .start_process_instance("parallel_review", vars(json!({"reviewers": []})))
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["done".to_string()]);
}

#[test]
fn test_collection_must_be_an_array() {
    let engine = engine(&[PARALLEL_REVIEW]);
    let err = engine
        .start_process_instance("parallel_review", vars(json!({"reviewers": "ann"})))
        .unwrap_err();
    assert!(err.is_configuration());
}

const QUORUM: &str = r#"
key: quorum
initial: vote
nodes:
  - id: vote
    kind: UserTask
    multi_instance:
      loop_cardinality: "4"
      completion_condition: "${nrOfCompletedInstances >= 2}"
    outgoing:
      - target: done
  - id: done
    kind: UserTask
"#;

fn loop_counts(tree: &ExecutionTree, scope: ExecutionId) -> (u64, u64) {
    let count = |name| {
        tree.get_variable_local(scope, name)
            .and_then(|v| v.as_u64())
            .unwrap()
    };
    (count(NR_OF_ACTIVE_INSTANCES), count(NR_OF_COMPLETED_INSTANCES))
}

#[test]
fn test_quorum_cancels_waiting_iterations() {
    let engine = engine(&[QUORUM]);
    let mut tree = engine
        .start_process_instance("quorum", Variables::new())
        .unwrap();

    let scope = loop_scope(&tree);
    let iterations: Vec<_> = tree.children(scope).to_vec();
    assert_eq!(iterations.len(), 4);
    assert_eq!(loop_counts(&tree, scope), (4, 0));

    for (signalled, iteration) in iterations.iter().take(2).enumerate() {
        engine
            .signal(&mut tree, *iteration, None, Value::Null)
            .unwrap();
        let (active, completed) = loop_counts(&tree, scope);
        assert_eq!(completed, signalled as u64 + 1);
        assert_eq!(active + completed, 4);
    }

    assert_eq!(tree.active_node_ids(), vec!["done".to_string()]);
    assert!(tree.execution(scope).unwrap().is_ended());
    for (i, iteration) in iterations.iter().enumerate() {
        let reason = tree.execution(*iteration).unwrap().end_reason.clone();
        match i {
            0 | 1 => assert_eq!(reason, Some(EndReason::Completed)),
            _ => assert!(matches!(reason, Some(EndReason::Destroyed { .. }))),
        }
    }
    assert_eq!(
        recorded(&tree, |e| matches!(
            e,
            RuntimeEvent::LoopCompleted {
                early: true,
                nr_of_completed_instances: 2,
                ..
            }
        )),
        1
    );
}

/// Raises `NO_QUOTA` for any expression mentioning `quota`.
struct QuotaEvaluator;

impl ExpressionEvaluator for QuotaEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        scope: &dyn VariableScope,
    ) -> Result<Value, ExpressionError> {
        if expression.contains("quota") {
            return Err(ExpressionError::Business(BpmnError::new("NO_QUOTA")));
        }
        DefaultEvaluator.evaluate(expression, scope)
    }
}

const QUOTA_LOOP: &str = r#"
key: quota_loop
initial: t
nodes:
  - id: t
    kind: Task
    multi_instance:
      loop_cardinality: "${quota}"
    outgoing:
      - target: done
  - id: over_quota
    kind: BoundaryErrorEvent
    attached_to: t
    error_code: NO_QUOTA
    outgoing:
      - target: h
  - id: h
    kind: UserTask
  - id: done
    kind: EndEvent
"#;

#[test]
fn test_error_raised_by_cardinality_reaches_boundary() {
    let collaborators =
        Collaborators::new(cache_with(&[QUOTA_LOOP])).with_expressions(Arc::new(QuotaEvaluator));
    let engine = Engine::new(collaborators, EngineConfig::default());
    let tree = engine
        .start_process_instance("quota_loop", Variables::new())
        .unwrap();

    assert_eq!(tree.active_node_ids(), vec!["h".to_string()]);
    assert!(!tree
        .executions()
        .any(|e| e.role == ExecutionRole::LoopScope));
    assert_eq!(
        recorded(&tree, |e| matches!(
            e,
            RuntimeEvent::ErrorCaught { boundary_id, .. } if boundary_id == "over_quota"
        )),
        1
    );
}

const LOOPED_SUB_PROCESS: &str = r#"
key: looped_sub
initial: batch
nodes:
  - id: batch
    kind: SubProcess
    initial: step
    multi_instance:
      loop_cardinality: "2"
    outgoing:
      - target: done
  - id: step
    kind: ReceiveTask
    parent: batch
  - id: done
    kind: UserTask
"#;

#[test]
fn test_multi_instance_sub_process_gets_a_body_scope() {
    let engine = engine(&[LOOPED_SUB_PROCESS]);
    let mut tree = engine
        .start_process_instance("looped_sub", Variables::new())
        .unwrap();

    let bodies = tree
        .executions()
        .filter(|e| e.role == ExecutionRole::LoopBody)
        .count();
    assert_eq!(bodies, 2);
    assert_eq!(tree.active_node_ids(), vec!["step".to_string(), "step".to_string()]);

    signal_node(&engine, &mut tree, "step", Value::Null);
    signal_node(&engine, &mut tree, "step", Value::Null);
    assert_eq!(tree.active_node_ids(), vec!["done".to_string()]);
}

const LOOPED_FAILURE: &str = r#"
key: looped_failure
initial: items
nodes:
  - id: items
    kind: ServiceTask
    handler: charge_card
    multi_instance:
      loop_cardinality: "3"
    outgoing:
      - target: done
  - id: item_failed
    kind: BoundaryErrorEvent
    attached_to: items
    outgoing:
      - target: review
  - id: review
    kind: UserTask
  - id: done
    kind: EndEvent
"#;

#[test]
fn test_error_in_iteration_is_caught_on_the_loop_owner() {
    let engine = engine_with_services(&[LOOPED_FAILURE], raising("ITEM_FAILED"));
    let tree = engine
        .start_process_instance("looped_failure", Variables::new())
        .unwrap();

    assert_eq!(tree.active_node_ids(), vec!["review".to_string()]);
    assert!(tree
        .executions()
        .filter(|e| e.role.is_loop_member())
        .all(|e| e.is_ended()));
}

// ── Listeners ──

const LISTENED: &str = r#"
key: listened
initial: task
nodes:
  - id: task
    kind: Task
    multi_instance:
      loop_cardinality: "2"
    listeners:
      - event: start
        listener: audit
      - event: end
        listener: audit
    outgoing:
      - target: end
  - id: end
    kind: EndEvent
    listeners:
      - event: start
        listener: audit
"#;

#[test]
fn test_listeners_fire_per_iteration() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let mut listeners = ListenerRegistry::new();
    listeners.register_fn("audit", move |event, execution| {
        let node = execution.node_id().unwrap_or("?").to_string();
        sink.lock()
            .map_err(|e| anyhow::anyhow!("Lock: {}", e))?
            .push(format!("{}:{}", event.as_str(), node));
        Ok(())
    });
    let collaborators =
        Collaborators::new(cache_with(&[LISTENED])).with_listeners(Arc::new(listeners));
    let engine = Engine::new(collaborators, EngineConfig::default());

    let tree = engine
        .start_process_instance("listened", Variables::new())
        .unwrap();
    assert_eq!(tree.process_state(), &ProcessState::Completed);

    let log = log.lock().unwrap();
    assert_eq!(log.iter().filter(|e| *e == "start:task").count(), 2);
    assert_eq!(log.iter().filter(|e| *e == "end:task").count(), 2);
    assert_eq!(log.last().map(String::as_str), Some("start:end"));
}

#[test]
fn test_unknown_listener_aborts() {
    let engine = engine(&[LISTENED]);
    let err = engine
        .start_process_instance("listened", Variables::new())
        .unwrap_err();
    assert!(matches!(err, Fault::Listener { .. }));
}

const LISTENED_BOUNDARY: &str = r#"
key: guarded
initial: charge
nodes:
  - id: charge
    kind: ServiceTask
    handler: charge_card
    outgoing:
      - target: done
  - id: declined
    kind: BoundaryErrorEvent
    attached_to: charge
    listeners:
      - event: start
        listener: audit
      - event: end
        listener: audit
    outgoing:
      - target: manual
  - id: manual
    kind: UserTask
  - id: done
    kind: EndEvent
"#;

#[test]
fn test_boundary_event_fires_start_and_end_listeners() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let mut listeners = ListenerRegistry::new();
    listeners.register_fn("audit", move |event, execution| {
        let node = execution.node_id().unwrap_or("?").to_string();
        sink.lock()
            .map_err(|e| anyhow::anyhow!("Lock: {}", e))?
            .push(format!("{}:{}", event.as_str(), node));
        Ok(())
    });
    let collaborators = Collaborators::new(cache_with(&[LISTENED_BOUNDARY]))
        .with_services(raising("CARD_DECLINED"))
        .with_listeners(Arc::new(listeners));
    let engine = Engine::new(collaborators, EngineConfig::default());

    let tree = engine
        .start_process_instance("guarded", Variables::new())
        .unwrap();
    assert_eq!(tree.active_node_ids(), vec!["manual".to_string()]);

    let log = log.lock().unwrap();
    assert_eq!(
        *log,
        vec!["start:declined".to_string(), "end:declined".to_string()]
    );
    assert_eq!(
        recorded(&tree, |e| matches!(
            e,
            RuntimeEvent::NodeEntered { node_id, .. } if node_id == "declined"
        )),
        1
    );
}

// ── Step limit ──

const SPIN: &str = r#"
key: spin
initial: a
nodes:
  - id: a
    kind: Task
    outgoing:
      - target: b
  - id: b
    kind: Task
    outgoing:
      - target: a
"#;

#[test]
fn test_step_limit_stops_runaway_loops() {
    let config = EngineConfig {
        max_steps: 50,
        ..EngineConfig::default()
    };
    let engine = Engine::new(Collaborators::new(cache_with(&[SPIN])), config);
    let err = engine
        .start_process_instance("spin", Variables::new())
        .unwrap_err();
    assert!(matches!(err, Fault::StepLimitExceeded(50)));
}

const BATCH: &str = r#"
key: batch
initial: item
nodes:
  - id: item
    kind: Task
    multi_instance:
      sequential: true
      loop_cardinality: "60"
    outgoing:
      - target: end
  - id: end
    kind: EndEvent
"#;

#[test]
fn test_non_waiting_sequential_loop_counts_every_iteration() {
    let with_limit = |max_steps| {
        let config = EngineConfig {
            max_steps,
            ..EngineConfig::default()
        };
        Engine::new(Collaborators::new(cache_with(&[BATCH])), config)
    };

    let err = with_limit(50)
        .start_process_instance("batch", Variables::new())
        .unwrap_err();
    assert!(matches!(err, Fault::StepLimitExceeded(50)));

    let tree = with_limit(200)
        .start_process_instance("batch", Variables::new())
        .unwrap();
    assert_eq!(tree.process_state(), &ProcessState::Completed);
    assert_eq!(
        recorded(&tree, |e| matches!(e, RuntimeEvent::LoopIterationStarted { .. })),
        60
    );
}

// ── Journal ──

#[test]
fn test_events_are_sequenced() {
    let engine = engine(&[APPROVAL]);
    let tree = engine
        .start_process_instance("approval", Variables::new())
        .unwrap();
    let seqs: Vec<u64> = tree.events().iter().map(|(seq, _)| *seq).collect();
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    assert!(matches!(
        tree.events().first(),
        Some((1, RuntimeEvent::InstanceStarted { .. }))
    ));
}

#[test]
fn test_prune_ended_keeps_the_root() {
    let engine = engine(&[FAN_OUT]);
    let mut tree = engine
        .start_process_instance("fan_out", Variables::new())
        .unwrap();
    signal_node(&engine, &mut tree, "a", Value::Null);

    assert_eq!(tree.prune_ended(), 1);
    assert!(tree.execution(tree.root()).is_some());
    assert_eq!(tree.active_node_ids(), vec!["b".to_string()]);
}

//! bpmn-flow: deploy YAML process definitions, run one instance and print
//! where it ended up.
//!
//! ```text
//! bpmn-flow --definition order.yaml --definition payment.yaml \
//!     --process order --vars '{"amount": 120}' \
//!     --signal review='{"approved": true}' --events
//! ```

use anyhow::{anyhow, bail, Context, Result};
use bpmn_flow_core::{
    Collaborators, DelegateExecution, Engine, EngineConfig, ExecutionTree, HandlerError,
    MemoryDefinitionCache, ServiceRegistry, Value, Variables,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "bpmn-flow")]
#[command(about = "Run a BPMN process instance from YAML definitions")]
struct Args {
    /// Process definition YAML file (repeatable)
    #[arg(long, short = 'd', required = true)]
    definition: Vec<PathBuf>,

    /// Process key to start
    #[arg(long, short = 'p')]
    process: String,

    /// Initial variables as a JSON object
    #[arg(long)]
    vars: Option<String>,

    /// Signal the first active execution at NODE, optionally with a JSON payload (repeatable)
    #[arg(long, value_name = "NODE[=JSON]")]
    signal: Vec<String>,

    /// Engine config YAML; environment overrides still apply
    #[arg(long, env = "BPMN_FLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Include the runtime event journal in the output
    #[arg(long)]
    events: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            EngineConfig::from_yaml_str(&text)?.with_env_overrides()?
        }
        None => EngineConfig::from_env()?,
    };

    let cache = Arc::new(MemoryDefinitionCache::new());
    for path in &args.definition {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let deployed = cache
            .deploy_yaml(&yaml)
            .with_context(|| format!("Failed to deploy {}", path.display()))?;
        tracing::info!(
            process_key = %deployed.process_key,
            version = deployed.version,
            hash = %hex::encode(&deployed.content_hash[..8]),
            "Deployed {}",
            path.display()
        );
    }

    let mut services = ServiceRegistry::new();
    services.set_fallback(Arc::new(log_service_call));
    let engine = Engine::new(
        Collaborators::new(cache).with_services(services),
        config,
    );

    let variables = parse_vars(args.vars.as_deref())?;
    let mut tree = engine.create_process_instance(&args.process, variables)?;
    let mut failure = engine.start(&mut tree).err();

    for raw in &args.signal {
        if failure.is_some() {
            break;
        }
        let (node, payload) = parse_signal(raw)?;
        let execution = tree
            .find_active_execution(node)
            .ok_or_else(|| anyhow!("No active execution at node '{}'", node))?;
        failure = engine.signal(&mut tree, execution, Some(node), payload).err();
    }

    println!("{}", serde_json::to_string_pretty(&report(&tree, args.events)?)?);

    match failure {
        Some(fault) => Err(fault.into()),
        None => Ok(()),
    }
}

/// Stand-in for unregistered service tasks: logs and moves on.
fn log_service_call(execution: &mut DelegateExecution<'_>) -> Result<(), HandlerError> {
    tracing::info!(
        execution = %execution.id(),
        node = execution.node_id().unwrap_or("?"),
        "Service task (no handler registered)"
    );
    Ok(())
}

fn parse_vars(raw: Option<&str>) -> Result<Variables> {
    let Some(raw) = raw else {
        return Ok(Variables::new());
    };
    match serde_json::from_str::<Value>(raw).context("--vars is not valid JSON")? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("--vars must be a JSON object, got {}", other),
    }
}

fn parse_signal(raw: &str) -> Result<(&str, Value)> {
    match raw.split_once('=') {
        Some((node, json)) => {
            let payload = serde_json::from_str(json)
                .with_context(|| format!("Signal payload for '{}' is not valid JSON", node))?;
            Ok((node, payload))
        }
        None => Ok((raw, Value::Null)),
    }
}

fn report(tree: &ExecutionTree, with_events: bool) -> Result<Value> {
    let mut out = serde_json::json!({
        "instance_id": tree.instance_id().to_string(),
        "process_key": tree.process_key(),
        "state": serde_json::to_value(tree.process_state())?,
        "active_nodes": tree.active_node_ids(),
        "variables": tree.variables(tree.root()),
    });
    if with_events {
        let events = tree
            .events()
            .iter()
            .map(|(seq, event)| serde_json::json!({ "seq": seq, "event": event }))
            .collect::<Vec<_>>();
        out["events"] = Value::Array(events);
    }
    Ok(out)
}

use super::ProcessDefinition;
use anyhow::{Context, Result};

/// Parse a YAML document into a ProcessDefinition.
///
/// Validation is NOT performed here. `MemoryDefinitionCache::deploy` validates
/// before a definition becomes resolvable.
pub fn parse_definition_yaml(yaml_str: &str) -> Result<ProcessDefinition> {
    let definition: ProcessDefinition =
        serde_yaml::from_str(yaml_str).context("Failed to parse process definition YAML")?;
    Ok(definition)
}

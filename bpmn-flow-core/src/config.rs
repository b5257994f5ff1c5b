use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_MAX_STEPS: &str = "BPMN_FLOW_MAX_STEPS";
pub const ENV_RECORD_EVENTS: &str = "BPMN_FLOW_RECORD_EVENTS";

/// Engine tuning knobs shared by every dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on agenda operations per entry-point call. Iterations of a
    /// sequential multi-instance that never wait all run inside one call and
    /// take at least one step each, so large loops of that kind need a higher
    /// bound than the default.
    pub max_steps: usize,
    /// Keep the `RuntimeEvent` journal on new execution trees.
    pub record_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            record_events: true,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).context("Failed to parse engine config")?;
        config.check()?;
        Ok(config)
    }

    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(raw) = lookup(ENV_MAX_STEPS) {
            self.max_steps = raw.trim().parse().with_context(|| {
                format!("{} must be a positive integer, got '{}'", ENV_MAX_STEPS, raw)
            })?;
        }
        if let Some(raw) = lookup(ENV_RECORD_EVENTS) {
            self.record_events = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(anyhow!(
                        "{} must be a boolean, got '{}'",
                        ENV_RECORD_EVENTS,
                        other
                    ))
                }
            };
        }
        self.check()?;
        Ok(self)
    }

    fn check(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be at least 1"));
        }
        Ok(())
    }
}

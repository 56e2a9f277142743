use std::collections::HashMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::factory::WorkerActivationPolicy;

fn bool_true() -> bool {
    true
}

/// Worker-enablement table (rotor.toml + ROTOR_* env overrides).
///
/// ```toml
/// default_enabled = true
///
/// [workers]
/// delegate_disconnect = false
/// pipeline_cleanup = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Applied to entity types without an explicit entry.
    /// Override with env var: ROTOR_DEFAULT_ENABLED=false
    #[serde(default = "bool_true")]
    pub default_enabled: bool,

    /// Per-entity-type overrides, keyed by the type name handed to the
    /// factory.
    #[serde(default)]
    pub workers: HashMap<String, bool>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            workers: HashMap::new(),
        }
    }
}

impl WorkersConfig {
    /// Load `rotor.toml` from the working directory, then apply `ROTOR_*`
    /// environment overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment(Toml::file("rotor.toml")).extract()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Self::figment(Toml::file(path.as_ref())).extract()
    }

    fn figment(provider: impl figment::Provider) -> Figment {
        Figment::new().merge(provider).merge(Env::prefixed("ROTOR_"))
    }
}

impl WorkerActivationPolicy for WorkersConfig {
    fn is_active(&self, entity_type: &str) -> bool {
        self.workers
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_everything() {
        let config = WorkersConfig::default();
        assert!(config.is_active("anything"));
    }

    #[test]
    fn toml_overrides_specific_workers() {
        let config: WorkersConfig = WorkersConfig::figment(Toml::string(
            r#"
            default_enabled = true

            [workers]
            delegate_disconnect = false
            "#,
        ))
        .extract()
        .unwrap();

        assert!(!config.is_active("delegate_disconnect"));
        assert!(config.is_active("pipeline_cleanup"));
    }

    #[test]
    fn default_can_be_flipped_off() {
        let config: WorkersConfig = WorkersConfig::figment(Toml::string(
            r#"
            default_enabled = false

            [workers]
            heartbeat = true
            "#,
        ))
        .extract()
        .unwrap();

        assert!(config.is_active("heartbeat"));
        assert!(!config.is_active("anything_else"));
    }
}

//! Ambient configuration: engine parameters and role bindings, loaded from a
//! TOML file (the compiled policy pack's on-disk representation, spec §6).

use crate::error::Error;
use crate::link::LinkAdmissibilityTable;
use crate::types::LinkType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Close order across subledgers (spec §4.9); defaults to
    /// [`crate::subledger::DEFAULT_CLOSE_ORDER`] when absent from the file.
    #[serde(default = "default_close_order")]
    pub close_order: Vec<String>,

    /// Row-lock tolerance below which a subledger/control-account residual is
    /// considered reconciled (R17), keyed by currency code.
    #[serde(default)]
    pub reconciliation_tolerance_overrides: std::collections::BTreeMap<String, String>,

    /// Maximum bounded-depth traversal for the link graph's acyclicity check
    /// (L3).
    #[serde(default = "default_max_link_traversal_depth")]
    pub max_link_traversal_depth: usize,

    /// Cap on FAILED -> RETRYING cycles before an event is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Admissible (parent_type, link_type, child_type) triples for
    /// [`crate::link::LinkGraph`] (L5).
    #[serde(default)]
    pub link_admissibility: Vec<LinkAdmissibilityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkAdmissibilityEntry {
    pub parent_type: String,
    pub link_type: LinkType,
    pub child_type: String,
}

fn default_close_order() -> Vec<String> {
    crate::subledger::DEFAULT_CLOSE_ORDER
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_link_traversal_depth() -> usize {
    64
}

fn default_max_retries() -> u32 {
    crate::coordinator::MAX_RETRIES
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            close_order: default_close_order(),
            reconciliation_tolerance_overrides: Default::default(),
            max_link_traversal_depth: default_max_link_traversal_depth(),
            max_retries: default_max_retries(),
            link_admissibility: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid engine config: {e}")))
    }

    pub fn link_admissibility_table(&self) -> LinkAdmissibilityTable {
        self.link_admissibility
            .iter()
            .map(|entry| (entry.parent_type.clone(), entry.link_type, entry.child_type.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_retries, crate::coordinator::MAX_RETRIES);
        assert_eq!(config.close_order.first().unwrap(), "inventory");
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_toml_str("max_retries = 2\nclose_order = [\"ar\", \"gl\"]").unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.close_order, vec!["ar".to_string(), "gl".to_string()]);
    }
}

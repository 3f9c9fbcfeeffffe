use serde::{Deserialize, Serialize};

use crate::error::{FrameError, Result};

/// Settings shared by every relation created with them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Output alias of the single column selected by type probes.
    pub probe_alias: String,
    /// Alias given to every nested subquery of the replayed relation.
    pub subtable_alias: String,
    /// Emit a warning when an order-independent aggregate receives an `order_by`.
    pub warn_on_ignored_order_by: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            probe_alias: "probe".to_string(),
            subtable_alias: "sqlframe_subtable".to_string(),
            warn_on_ignored_order_by: true,
        }
    }
}

impl FrameConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| FrameError::Config(e.to_string()))
    }

    /// Override fields from `SQLFRAME_*` environment variables.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(alias) = lookup("SQLFRAME_PROBE_ALIAS") {
            self.probe_alias = alias;
        }
        if let Some(alias) = lookup("SQLFRAME_SUBTABLE_ALIAS") {
            self.subtable_alias = alias;
        }
        if let Some(flag) = lookup("SQLFRAME_WARN_ON_IGNORED_ORDER_BY") {
            self.warn_on_ignored_order_by = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(FrameError::Config(format!(
                        "SQLFRAME_WARN_ON_IGNORED_ORDER_BY must be a boolean, got '{other}'"
                    )))
                }
            };
        }
        Ok(self)
    }
}

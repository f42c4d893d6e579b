//! Graph configuration.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tuning parameters for a [`Graph`](crate::Graph).
///
/// None of these are part of the graph's behavioural contract; they bound
/// resource use and catch runaway feedback loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Released link slots kept for reuse. Slots released while the free
    /// list is full are not recycled.
    pub link_pool_size: usize,
    /// Nested `emit` calls allowed on a single entity.
    pub max_emit_depth: usize,
    /// Deactivation attempts made by `destroy` before giving up.
    pub max_deactivate_retries: usize,
    /// Queued scheduler tasks above which a backlog warning is logged.
    pub scheduler_high_water: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            link_pool_size: 256,
            max_emit_depth: 4,
            max_deactivate_retries: 3,
            scheduler_high_water: 500,
        }
    }
}

impl GraphConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GraphConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_link_pool_size(mut self, size: usize) -> Self {
        self.link_pool_size = size;
        self
    }

    pub fn with_max_emit_depth(mut self, depth: usize) -> Self {
        self.max_emit_depth = depth;
        self
    }

    pub fn with_max_deactivate_retries(mut self, retries: usize) -> Self {
        self.max_deactivate_retries = retries;
        self
    }

    /// Raise limits that must be at least 1, logging each adjustment.
    pub(crate) fn clamped(mut self) -> Self {
        if let Err(err) = self.validate() {
            tracing::warn!(error = %err, "invalid graph config, clamping limits to 1");
            self.max_emit_depth = self.max_emit_depth.max(1);
            self.max_deactivate_retries = self.max_deactivate_retries.max(1);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_emit_depth == 0 {
            return Err(Error::Config("max_emit_depth must be at least 1".into()));
        }
        if self.max_deactivate_retries == 0 {
            return Err(Error::Config("max_deactivate_retries must be at least 1".into()));
        }
        Ok(())
    }
}

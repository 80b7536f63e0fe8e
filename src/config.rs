//! Tunable limits for the engine

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

/// Configuration for a [`DecisionTree`](crate::decision_tree::DecisionTree)
/// and the worker driving it
///
/// Every field has a default, so a config file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Operations a single work slice may perform before yielding
    pub max_operations: usize,
    /// Pause between work slices, in milliseconds
    pub operation_delay_ms: u64,
    /// Upper bound on bytes allocated for layer buffers
    pub max_memory: usize,
    /// Number of layers a node may hold before it must delegate to child nodes
    pub max_depth: usize,
    /// Fraction of childless boards in a layer above which a node delegates early
    pub split_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            operation_delay_ms: 50,
            max_memory: 256 * 1024 * 1024,
            max_depth: 10,
            split_threshold: 0.5,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = BufReader::new(File::open(path.as_ref())?);
        let config: Self = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_operations == 0 {
            return Err(anyhow!("max_operations must be at least 1"));
        }
        if self.max_memory == 0 {
            return Err(anyhow!("max_memory must be at least 1 byte"));
        }
        if self.max_depth < 2 {
            return Err(anyhow!(
                "max_depth must be at least 2, got {}",
                self.max_depth
            ));
        }
        if !(0.0..=1.0).contains(&self.split_threshold) {
            return Err(anyhow!(
                "split_threshold must be between 0 and 1, got {}",
                self.split_threshold
            ));
        }
        Ok(())
    }

    pub fn operation_delay(&self) -> Duration {
        Duration::from_millis(self.operation_delay_ms)
    }
}

//! Runtime configuration for the simulated driver.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically. Missing
//! fields fall back to their defaults.

use crate::error::KmtResult;
use crate::gmm::hw_info::HardwareInfo;
use crate::kmt::fence::CompletionMode;
use crate::kmt::handle::MAX_HANDLES;
use crate::kmt::va::FaultBudget;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Driver-interface behaviour.
    pub driver: DriverConfig,

    /// Hardware the adapter reports.
    pub hardware: HardwareInfo,
}

/// Driver-interface knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// When submitted paging and queue work is reported complete.
    pub completion: CompletionMode,

    /// Injected map failures, `(count, max)`. `max == 0` disables injection.
    pub map_fault_budget: FaultBudget,

    /// Upper bound on live handles.
    pub max_handles: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            completion: CompletionMode::Immediate,
            map_fault_budget: FaultBudget::default(),
            max_handles: MAX_HANDLES,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when it does not exist.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read and `Config` if it is not valid JSON.
    pub fn load(path: &Path) -> KmtResult<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            Self::from_json(&data)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// # Errors
    /// Returns `Config` if `json` is malformed.
    pub fn from_json(json: &str) -> KmtResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[must_use]
    pub const fn with_completion(mut self, completion: CompletionMode) -> Self {
        self.driver.completion = completion;
        self
    }

    #[must_use]
    pub const fn with_map_fault_budget(mut self, budget: FaultBudget) -> Self {
        self.driver.map_fault_budget = budget;
        self
    }

    #[must_use]
    pub const fn with_hardware(mut self, hardware: HardwareInfo) -> Self {
        self.hardware = hardware;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmm::hw_info::{GPU_ADDRESS_SPACE_48BIT, RenderCoreFamily};

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.driver.completion, CompletionMode::Immediate);
        assert_eq!(cfg.driver.map_fault_budget, FaultBudget::new(0, 0));
        assert_eq!(cfg.hardware.capability_table.gpu_address_space, GPU_ADDRESS_SPACE_48BIT);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg = Config::from_json(
            r#"{ "driver": { "completion": "deferred", "map_fault_budget": { "count": 0, "max": 2 } } }"#,
        )
        .unwrap();
        assert_eq!(cfg.driver.completion, CompletionMode::Deferred);
        assert_eq!(cfg.driver.map_fault_budget.max, 2);
        assert_eq!(cfg.driver.max_handles, MAX_HANDLES);
        assert_eq!(cfg.hardware.platform.render_core_family, RenderCoreFamily::Gen12Lp);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = Config::from_json("{ driver: ").unwrap_err();
        assert!(matches!(err, crate::error::KmtError::Config(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/kmt-config.json")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}

//! Tiered limits.
//!
//! A tiered limit maps a caller attribute, such as a subscription plan, to
//! its own ceiling. The tier is supplied alongside the identifier in each
//! [`CheckRequest`]; callers without a recognised tier get the default.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::decision::CheckRequest;
use super::policy::LimitResolver;
use crate::error::{GatekeeperError, Result};

/// Ceiling per tier, with a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredLimit {
    /// Ceiling for requests without a known tier
    pub default_max: u64,
    /// Tier name to ceiling
    #[serde(default)]
    pub tiers: HashMap<String, u64>,
}

impl TieredLimit {
    /// A tier table where every caller gets `default_max`.
    pub fn new(default_max: u64) -> Self {
        Self {
            default_max,
            tiers: HashMap::new(),
        }
    }

    /// Add or replace one tier.
    pub fn with_tier(mut self, name: impl Into<String>, max: u64) -> Self {
        self.tiers.insert(name.into(), max);
        self
    }

    /// Load a tier table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading tier limits");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a tier table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let tiers: TieredLimit = serde_yaml::from_str(yaml).map_err(|e| {
            GatekeeperError::Configuration(format!("Failed to parse tier limits: {}", e))
        })?;
        tiers.validate()?;
        Ok(tiers)
    }

    /// Reject zero ceilings.
    pub fn validate(&self) -> Result<()> {
        if self.default_max == 0 {
            return Err(GatekeeperError::Configuration(
                "default_max must be greater than zero".to_string(),
            ));
        }
        if let Some((name, _)) = self.tiers.iter().find(|(_, max)| **max == 0) {
            return Err(GatekeeperError::Configuration(format!(
                "tier {} must have a max greater than zero",
                name
            )));
        }
        Ok(())
    }

    /// The ceiling for a tier name, if configured.
    pub fn get_tier(&self, name: &str) -> Option<u64> {
        self.tiers.get(name).copied()
    }
}

impl LimitResolver for TieredLimit {
    fn resolve_limit(&self, request: &CheckRequest) -> u64 {
        request
            .tier()
            .and_then(|tier| self.get_tier(tier))
            .unwrap_or(self.default_max)
    }
}

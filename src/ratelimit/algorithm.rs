//! Limiting algorithms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::GatekeeperError;

/// How a limiter turns store state into a decision.
///
/// Chosen once per limiter; one limiter never mixes algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter reset at fixed window boundaries. O(1) per check, but up to
    /// twice the limit can pass across a boundary.
    #[default]
    FixedWindow,
    /// Exact trailing window over a log of admission timestamps.
    SlidingLog,
    /// Fixed window over a points budget; an over-budget request is rejected
    /// without consuming anything.
    CostBased,
}

impl Algorithm {
    /// The configuration name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingLog => "sliding_log",
            Algorithm::CostBased => "cost_based",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = GatekeeperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_window" => Ok(Algorithm::FixedWindow),
            "sliding_log" => Ok(Algorithm::SlidingLog),
            "cost_based" => Ok(Algorithm::CostBased),
            other => Err(GatekeeperError::Configuration(format!(
                "unknown algorithm: {}",
                other
            ))),
        }
    }
}

//! Engine configuration, read with the `config` crate from an optional file
//! and `CANDIDATES_*` environment variables.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{CandidateError, Result};

pub const DEFAULT_DENSITY_THRESHOLD: f64 = 0.3;
pub const DEFAULT_MAX_WORKERS: u32 = 4;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Matched fraction of a subject's observations at and above which the
    /// dense strategy is used.
    pub density_threshold: f64,
    /// Cap on auxiliary worker threads used while populating transient relations.
    pub max_workers: u32,
    /// Use store specific population hints; `false` selects the no-op policy.
    pub bulk_hints: bool,
    /// File backed database, in memory when absent.
    pub database: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            density_threshold: DEFAULT_DENSITY_THRESHOLD,
            max_workers: DEFAULT_MAX_WORKERS,
            bulk_hints: true,
            database: None,
        }
    }
}

impl EngineConfig {
    /// Layers the optional config file (any format `config` understands) and
    /// the environment over the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(Environment::with_prefix("CANDIDATES").try_parsing(true))
            .build()?;
        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
    pub fn validate(&self) -> Result<()> {
        DensityThreshold::new(self.density_threshold)?;
        if self.max_workers == 0 {
            return Err(CandidateError::Config(
                "max_workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
    pub fn threshold(&self) -> Result<DensityThreshold> {
        DensityThreshold::new(self.density_threshold)
    }
}

const PARTS: u64 = 1_000_000;

/// A density threshold held in parts per million so comparisons are exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DensityThreshold {
    ppm: u64,
}

impl DensityThreshold {
    pub fn new(fraction: f64) -> Result<Self> {
        if !fraction.is_finite() || fraction <= 0.0 || fraction > 1.0 {
            return Err(CandidateError::Config(format!(
                "density threshold must be within (0, 1], got {fraction}"
            )));
        }
        let ppm = (fraction * PARTS as f64).round() as u64;
        Ok(Self { ppm: ppm.max(1) })
    }
    pub fn as_fraction(&self) -> f64 {
        self.ppm as f64 / PARTS as f64
    }
    /// Whether `matched / total` reaches the threshold. A count at or above
    /// the total always does.
    pub fn reached_by(&self, matched: u64, total: u64) -> bool {
        matched as u128 * PARTS as u128 >= self.ppm as u128 * total as u128
    }
}

impl Default for DensityThreshold {
    fn default() -> Self {
        Self {
            ppm: (DEFAULT_DENSITY_THRESHOLD * PARTS as f64).round() as u64,
        }
    }
}

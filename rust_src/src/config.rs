//! Run configuration: estimator settings, flag thresholds and sample-size tiers.
//!
//! Every field has a serde default, so a config file only needs to name the
//! values it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub estimation: EstimationConfig,

    #[serde(default)]
    pub thresholds: FlagThresholds,

    #[serde(default)]
    pub tiers: SampleTiers,
}

/// Settings for the marginal maximum likelihood EM fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationConfig {
    /// Gauss-Hermite quadrature points.
    #[serde(default = "default_n_quadpts")]
    pub n_quadpts: usize,

    #[serde(default = "default_max_iter")]
    pub max_iter: usize,

    /// Absolute change in marginal log-likelihood that ends EM.
    #[serde(default = "default_tol")]
    pub tol: f64,

    /// Newton iterations per item in each M-step.
    #[serde(default = "default_newton_steps")]
    pub newton_steps: usize,

    /// Estimate the latent standard deviation instead of fixing it at 1.
    #[serde(default)]
    pub estimate_latent_sd: bool,
}

fn default_n_quadpts() -> usize {
    21
}

fn default_max_iter() -> usize {
    1000
}

fn default_tol() -> f64 {
    1e-4
}

fn default_newton_steps() -> usize {
    10
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            n_quadpts: default_n_quadpts(),
            max_iter: default_max_iter(),
            tol: default_tol(),
            newton_steps: default_newton_steps(),
            estimate_latent_sd: false,
        }
    }
}

/// Numeric cut-offs used by the flag rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagThresholds {
    /// R1: keyed correlation below this flags when the item is also hard.
    #[serde(default = "default_low_key_correlation")]
    pub low_key_correlation: f64,

    /// R1: "hard" means average_correct below this.
    #[serde(default = "default_low_key_average_correct")]
    pub low_key_average_correct: f64,

    /// R1: keyed correlation below this flags on its own.
    #[serde(default = "default_negative_key_correlation")]
    pub negative_key_correlation: f64,

    /// R2: distractor correlation above this flags.
    #[serde(default = "default_distractor_correlation")]
    pub distractor_correlation: f64,

    /// R2/R3: distractors need strictly more respondents than this.
    #[serde(default = "default_min_distractor_count")]
    pub min_distractor_count: usize,

    /// R4: keyed relative frequency below this.
    #[serde(default = "default_low_key_proportion")]
    pub low_key_proportion: f64,

    /// R4/R5: keyed correlation below this.
    #[serde(default = "default_weak_key_correlation")]
    pub weak_key_correlation: f64,

    /// R5: distractor relative frequency above this.
    #[serde(default = "default_dominant_distractor_share")]
    pub dominant_distractor_share: f64,

    /// R6: average response time above this, in the units supplied.
    #[serde(default = "default_max_average_time")]
    pub max_average_time: f64,
}

fn default_low_key_correlation() -> f64 {
    0.0
}

fn default_low_key_average_correct() -> f64 {
    0.65
}

fn default_negative_key_correlation() -> f64 {
    -0.15
}

fn default_distractor_correlation() -> f64 {
    0.05
}

fn default_min_distractor_count() -> usize {
    5
}

fn default_low_key_proportion() -> f64 {
    0.25
}

fn default_weak_key_correlation() -> f64 {
    0.10
}

fn default_dominant_distractor_share() -> f64 {
    0.5
}

fn default_max_average_time() -> f64 {
    120.0
}

impl Default for FlagThresholds {
    fn default() -> Self {
        Self {
            low_key_correlation: default_low_key_correlation(),
            low_key_average_correct: default_low_key_average_correct(),
            negative_key_correlation: default_negative_key_correlation(),
            distractor_correlation: default_distractor_correlation(),
            min_distractor_count: default_min_distractor_count(),
            low_key_proportion: default_low_key_proportion(),
            weak_key_correlation: default_weak_key_correlation(),
            dominant_distractor_share: default_dominant_distractor_share(),
            max_average_time: default_max_average_time(),
        }
    }
}

/// Upper bounds (inclusive) of the small and moderate sample tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleTiers {
    #[serde(default = "default_small_max")]
    pub small_max: usize,

    #[serde(default = "default_moderate_max")]
    pub moderate_max: usize,
}

fn default_small_max() -> usize {
    14
}

fn default_moderate_max() -> usize {
    49
}

impl Default for SampleTiers {
    fn default() -> Self {
        Self {
            small_max: default_small_max(),
            moderate_max: default_moderate_max(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let est = &self.estimation;
        if est.n_quadpts < 3 {
            return Err(invalid("estimation.n_quadpts", "must be at least 3"));
        }
        if est.max_iter == 0 {
            return Err(invalid("estimation.max_iter", "must be positive"));
        }
        if !(est.tol.is_finite() && est.tol > 0.0) {
            return Err(invalid("estimation.tol", "must be a positive number"));
        }
        if est.newton_steps == 0 {
            return Err(invalid("estimation.newton_steps", "must be positive"));
        }

        let t = &self.thresholds;
        for (field, value) in [
            ("thresholds.low_key_average_correct", t.low_key_average_correct),
            ("thresholds.low_key_proportion", t.low_key_proportion),
            ("thresholds.dominant_distractor_share", t.dominant_distractor_share),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "must lie in [0, 1]"));
            }
        }
        for (field, value) in [
            ("thresholds.low_key_correlation", t.low_key_correlation),
            ("thresholds.negative_key_correlation", t.negative_key_correlation),
            ("thresholds.distractor_correlation", t.distractor_correlation),
            ("thresholds.weak_key_correlation", t.weak_key_correlation),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(invalid(field, "must lie in [-1, 1]"));
            }
        }
        if !t.max_average_time.is_finite() {
            return Err(invalid("thresholds.max_average_time", "must be finite"));
        }

        if self.tiers.small_max >= self.tiers.moderate_max {
            return Err(invalid("tiers", "small_max must be below moderate_max"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AnalysisConfig::default();
        assert_eq!(config.thresholds.low_key_average_correct, 0.65);
        assert_eq!(config.thresholds.negative_key_correlation, -0.15);
        assert_eq!(config.thresholds.min_distractor_count, 5);
        assert_eq!(config.thresholds.max_average_time, 120.0);
        assert_eq!(config.tiers.small_max, 14);
        assert_eq!(config.tiers.moderate_max, 49);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = AnalysisConfig::from_toml_str(
            r#"
            [estimation]
            n_quadpts = 31

            [thresholds]
            max_average_time = 90.0
            "#,
        )
        .unwrap();
        assert_eq!(config.estimation.n_quadpts, 31);
        assert_eq!(config.estimation.max_iter, 1000);
        assert_eq!(config.thresholds.max_average_time, 90.0);
        assert_eq!(config.thresholds.low_key_proportion, 0.25);
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(
            AnalysisConfig::from_toml_str("").unwrap(),
            AnalysisConfig::default()
        );
    }

    #[test]
    fn rejects_inverted_tiers() {
        let err = AnalysisConfig::from_toml_str("[tiers]\nsmall_max = 60\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "tiers"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = AnalysisConfig::from_toml_str("[estimation\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[estimation]\ntol = 1e-5\nestimate_latent_sd = true").unwrap();
        let config = AnalysisConfig::load(file.path()).unwrap();
        assert_eq!(config.estimation.tol, 1e-5);
        assert!(config.estimation.estimate_latent_sd);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AnalysisConfig::load(Path::new("/nonexistent/itemflag.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

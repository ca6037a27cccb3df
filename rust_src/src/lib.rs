//! Psychometric item analysis backend.
//!
//! This crate scores examinee responses, estimates latent ability and flags
//! items whose statistics point at a defective key, a miskeyed distractor or
//! excessive response time:
//! - Set-difference scoring for dichotomous and polytomous (multi-select) items
//! - Rasch-family (Rasch / partial credit) MML-EM fitting with EAP scoring
//! - Item-level statistics (p-value, point-biserial / polyserial, alpha if
//!   deleted, infit / outfit)
//! - Option-level statistics with per-value point-biserials against theta
//! - A registry of flag rules gated by sample size
//!
//! Python bindings are available behind the `python` feature.

pub mod utils;

pub mod config;
pub mod correlation;
pub mod data;
pub mod error;
pub mod estimation;
pub mod flags;
pub mod pipeline;
pub mod polytomous;
pub mod response_time;
pub mod scoring;
pub mod statistics;

#[cfg(feature = "python")]
pub mod python;

pub use config::{AnalysisConfig, EstimationConfig, FlagThresholds, SampleTiers};
pub use data::{Item, ItemBank, ItemType, ResponseData, ResponseRecord, ResponseValue};
pub use error::{
    ConfigError, ItemAnalysisError, MalformedResponseError, ModelFitError, Result,
    UndefinedStatistic,
};
pub use estimation::{FitResult, ItemParameters, ModelDiagnostics, ThetaEstimates};
pub use flags::{Flag, FlagReport, FlagRow, RuleId, SampleTier};
pub use pipeline::{analyze, AnalysisReport};
pub use response_time::ResponseTimes;
pub use scoring::{score, ScoreMatrix, MISSING};
pub use statistics::{
    ItemStatistic, ItemStatisticsTable, Keyed, OptionStatistic, OptionStatisticsTable,
};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module for itemflag_rs
#[cfg(feature = "python")]
#[pymodule]
fn itemflag_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    python::register(m)?;
    Ok(())
}

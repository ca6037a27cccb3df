//! Error types for item analysis.
//!
//! Integrity errors (malformed responses, bad item metadata) and model-fit
//! errors abort a run. An undefined statistic is not fatal: it is recovered
//! as a missing value and never flags an item.

use thiserror::Error;

/// Top-level error for an analysis run.
#[derive(Debug, Error)]
pub enum ItemAnalysisError {
    #[error(transparent)]
    MalformedResponse(#[from] MalformedResponseError),

    #[error("model fit failed: {0}")]
    ModelFit(#[from] ModelFitError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid item '{item}': {reason}")]
    InvalidItem { item: String, reason: String },

    #[error("duplicate item id '{0}'")]
    DuplicateItem(String),

    #[error("unknown item id '{0}'")]
    UnknownItem(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// A response referenced a symbol outside the item's alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("person {person} gave symbol '{symbol}' on item '{item}', which is not in its alphabet")]
pub struct MalformedResponseError {
    pub person: usize,
    pub item: String,
    pub symbol: char,
}

/// Latent-trait estimation failed; no theta is produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelFitError {
    #[error("score matrix has no persons")]
    NoPersons,

    #[error("score matrix has no items")]
    NoItems,

    #[error("no person has a non-missing response")]
    NoRespondents,

    #[error("item '{0}' has no non-missing scores")]
    EmptyItem(String),

    #[error("item '{item}' has zero score variance (every respondent scored {score})")]
    ZeroVariance { item: String, score: i32 },

    #[error("score {score} on item '{item}' is outside 0..={max_score}")]
    ScoreOutOfRange {
        item: String,
        score: i32,
        max_score: i32,
    },

    #[error("EM did not converge after {iterations} iterations (last change {last_change:.3e})")]
    NotConverged { iterations: usize, last_change: f64 },

    #[error("log-likelihood became non-finite at iteration {0}")]
    NonFinite(usize),

    #[error("expected step parameters for {expected} items, found {found}")]
    ParameterMismatch { expected: usize, found: usize },
}

/// A statistic that cannot be computed from the data at hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UndefinedStatistic {
    #[error("fewer than {required} observations")]
    TooFewObservations { required: usize },

    #[error("zero variance")]
    ZeroVariance,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ItemAnalysisError {
    pub fn invalid_item(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidItem {
            item: item.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the run failed because the data violated an integrity rule.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedResponse(_)
                | Self::InvalidItem { .. }
                | Self::DuplicateItem(_)
                | Self::UnknownItem(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ItemAnalysisError>;

//! Item response times.
//!
//! Only the per-item average is used downstream. It can be supplied directly
//! or derived from raw person-by-item timings, where `NaN` marks a missing
//! observation.

use std::collections::BTreeMap;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::data::ItemBank;
use crate::error::{ItemAnalysisError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimes {
    averages: BTreeMap<String, f64>,
}

impl ResponseTimes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average times keyed by item id. Non-finite or negative averages are
    /// rejected.
    pub fn from_averages<I, S>(averages: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut times = Self::new();
        for (item, avg) in averages {
            times.insert(item, avg)?;
        }
        Ok(times)
    }

    /// Averages each column of a persons × items timing matrix over its
    /// observed (non-`NaN`) entries. Columns follow bank order; a column with
    /// no observations leaves that item without an average.
    pub fn from_matrix(bank: &ItemBank, timings: ArrayView2<'_, f64>) -> Result<Self> {
        if timings.ncols() != bank.len() {
            return Err(ItemAnalysisError::InvalidInput(format!(
                "timing matrix has {} columns for {} items",
                timings.ncols(),
                bank.len()
            )));
        }

        let mut times = Self::new();
        for (item, column) in bank.items().iter().zip(timings.columns()) {
            let mut sum = 0.0;
            let mut count = 0usize;
            for &t in column.iter().filter(|t| !t.is_nan()) {
                if t < 0.0 || t.is_infinite() {
                    return Err(ItemAnalysisError::InvalidInput(format!(
                        "response time {t} on item '{}' is not a non-negative number",
                        item.id
                    )));
                }
                sum += t;
                count += 1;
            }
            if count > 0 {
                times.averages.insert(item.id.clone(), sum / count as f64);
            }
        }
        Ok(times)
    }

    pub fn insert(&mut self, item: impl Into<String>, average: f64) -> Result<()> {
        let item = item.into();
        if !average.is_finite() || average < 0.0 {
            return Err(ItemAnalysisError::InvalidInput(format!(
                "average time {average} for item '{item}' is not a non-negative number"
            )));
        }
        self.averages.insert(item, average);
        Ok(())
    }

    pub fn get(&self, item: &str) -> Option<f64> {
        self.averages.get(item).copied()
    }

    pub fn len(&self) -> usize {
        self.averages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }
}

//! Python bindings.

use std::collections::HashMap;

use ndarray::Array2;
use numpy::{PyArray1, PyArray2, PyReadonlyArray2, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::{AnalysisConfig, EstimationConfig};
use crate::data::{Item, ItemBank, ItemType, ResponseData, ResponseRecord, ResponseValue};
use crate::error::ItemAnalysisError;
use crate::estimation;
use crate::pipeline;
use crate::response_time::ResponseTimes;
use crate::scoring::{self, ScoreMatrix, MISSING};

fn to_py_err(err: ItemAnalysisError) -> PyErr {
    match err {
        ItemAnalysisError::ModelFit(e) => PyRuntimeError::new_err(e.to_string()),
        err if err.is_integrity_error() => PyValueError::new_err(format!("invalid data: {err}")),
        other => PyValueError::new_err(other.to_string()),
    }
}

/// Score a persons × items grid of raw responses against per-item keys.
///
/// `None` cells are missing and score -1.
#[pyfunction]
#[pyo3(signature = (keys, responses))]
pub fn score_matrix<'py>(
    py: Python<'py>,
    keys: Vec<String>,
    responses: Vec<Vec<Option<String>>>,
) -> PyResult<Bound<'py, PyArray2<i32>>> {
    let keys: Vec<ResponseValue> = keys.iter().map(|k| ResponseValue::parse(k)).collect();
    if let Some((i, row)) = responses
        .iter()
        .enumerate()
        .find(|(_, row)| row.len() != keys.len())
    {
        return Err(PyValueError::new_err(format!(
            "row {i} has {} responses, expected {}",
            row.len(),
            keys.len()
        )));
    }

    let scores = Array2::from_shape_fn((responses.len(), keys.len()), |(i, j)| {
        responses[i][j]
            .as_deref()
            .map(|raw| scoring::score(&ResponseValue::parse(raw), &keys[j]))
            .unwrap_or(MISSING)
    });
    Ok(scores.to_pyarray(py))
}

/// Fit the Rasch-family model to an int32 score matrix (-1 missing).
///
/// Returns `(theta, se)`; persons with no responses get NaN.
#[pyfunction]
#[pyo3(signature = (scores, max_scores, n_quadpts=21, max_iter=1000, tol=1e-4))]
pub fn fit_theta<'py>(
    py: Python<'py>,
    scores: PyReadonlyArray2<i32>,
    max_scores: Vec<i32>,
    n_quadpts: usize,
    max_iter: usize,
    tol: f64,
) -> PyResult<(Bound<'py, PyArray1<f64>>, Bound<'py, PyArray1<f64>>)> {
    let scores = scores.as_array().to_owned();
    if scores.ncols() != max_scores.len() {
        return Err(PyValueError::new_err(format!(
            "score matrix has {} columns but {} max scores were given",
            scores.ncols(),
            max_scores.len()
        )));
    }
    let item_ids = (0..scores.ncols()).map(|j| format!("item{j}")).collect();
    let matrix = ScoreMatrix::from_parts(item_ids, max_scores, scores);
    let config = EstimationConfig {
        n_quadpts,
        max_iter,
        tol,
        ..EstimationConfig::default()
    };

    let result = estimation::fit(&matrix, &config)
        .map_err(|e| to_py_err(ItemAnalysisError::ModelFit(e)))?;
    let theta: Vec<f64> = result
        .theta
        .theta
        .iter()
        .map(|t| t.unwrap_or(f64::NAN))
        .collect();
    let se: Vec<f64> = result.theta.se.iter().map(|s| s.unwrap_or(f64::NAN)).collect();
    Ok((theta.to_pyarray(py), se.to_pyarray(py)))
}

/// Run the full analysis and return the report as JSON.
///
/// `items` holds `(id, item_type, key, alphabet)` tuples, `responses` holds
/// `(person, item, value)` records and `times` maps item id to average time.
#[pyfunction]
#[pyo3(signature = (items, responses, times=None, config_toml=None))]
pub fn analyze_json(
    items: Vec<(String, String, String, String)>,
    responses: Vec<(String, String, Option<String>)>,
    times: Option<HashMap<String, f64>>,
    config_toml: Option<&str>,
) -> PyResult<String> {
    let run = || -> Result<String, ItemAnalysisError> {
        let items = items
            .into_iter()
            .map(|(id, kind, key, alphabet)| {
                let item_type = match kind.as_str() {
                    "dichotomous" => ItemType::Dichotomous,
                    "polytomous" => ItemType::Polytomous,
                    other => {
                        return Err(ItemAnalysisError::invalid_item(
                            &id,
                            format!("unknown item type '{other}'"),
                        ))
                    }
                };
                Item::new(id, item_type, &key, &alphabet)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let bank = ItemBank::new(items)?;

        let records = responses
            .into_iter()
            .map(|(person, item, value)| ResponseRecord {
                person,
                item,
                value,
            });
        let data = ResponseData::from_records(&bank, records)?;
        let times = ResponseTimes::from_averages(times.unwrap_or_default())?;
        let config = match config_toml {
            Some(text) => AnalysisConfig::from_toml_str(text)?,
            None => AnalysisConfig::default(),
        };

        pipeline::analyze(&bank, &data, &times, &config)?.to_json()
    };
    run().map_err(to_py_err)
}

pub fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(score_matrix, m)?)?;
    m.add_function(wrap_pyfunction!(fit_theta, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_json, m)?)?;
    Ok(())
}

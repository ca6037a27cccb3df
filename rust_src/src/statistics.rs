//! Item-level and option-level statistics.
//!
//! Both tables are computed per item in parallel from the score matrix, the
//! raw responses and the fitted theta vector. Undefined values are stored as
//! `None`, never as zero.

use std::collections::BTreeMap;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::correlation::{mean, pearson, point_biserial, polyserial, sample_sd};
use crate::data::{Item, ItemBank, ItemType, ResponseData, ResponseValue};
use crate::error::UndefinedStatistic;
use crate::estimation::{ItemParameters, ThetaEstimates};
use crate::polytomous::expected_score_and_variance;
use crate::scoring::ScoreMatrix;
use crate::utils::EPSILON;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemStatistic {
    pub item_id: String,
    pub item_type: ItemType,
    pub max_score: i32,
    pub number_exposures: usize,
    /// Mean score divided by `max_score`.
    pub average_correct: Option<f64>,
    pub score_sd: Option<f64>,
    /// Point-biserial (dichotomous) or polyserial (polytomous) with theta.
    pub theta_score_correlation: Option<f64>,
    /// Cronbach's alpha of the test with this item removed.
    pub alpha_if_deleted: Option<f64>,
    pub difficulty: Option<f64>,
    pub infit: Option<f64>,
    pub outfit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemStatisticsTable {
    pub items: Vec<ItemStatistic>,
    pub cronbach_alpha: Option<f64>,
}

impl ItemStatisticsTable {
    pub fn get(&self, item_id: &str) -> Option<&ItemStatistic> {
        self.items.iter().find(|s| s.item_id == item_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Keyed {
    Key,
    Distractor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionStatistic {
    pub item_id: String,
    pub response: ResponseValue,
    pub keyed: Keyed,
    pub response_count: usize,
    pub relative_freq: f64,
    pub avg_theta: Option<f64>,
    pub sd_theta: Option<f64>,
    /// Point-biserial of "chose exactly this value" with theta, over everyone
    /// who answered the item.
    pub correlation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptionStatisticsTable {
    pub options: Vec<OptionStatistic>,
}

impl OptionStatisticsTable {
    pub fn for_item<'a>(&'a self, item_id: &'a str) -> impl Iterator<Item = &'a OptionStatistic> {
        self.options.iter().filter(move |o| o.item_id == item_id)
    }

    pub fn keyed_option(&self, item_id: &str) -> Option<&OptionStatistic> {
        self.options
            .iter()
            .find(|o| o.item_id == item_id && o.keyed == Keyed::Key)
    }

    pub fn distractors<'a>(
        &'a self,
        item_id: &'a str,
    ) -> impl Iterator<Item = &'a OptionStatistic> {
        self.for_item(item_id).filter(|o| o.keyed == Keyed::Distractor)
    }
}

/// Item-level statistics. `parameters`, when given, adds model difficulty and
/// infit/outfit mean squares.
pub fn item_statistics(
    bank: &ItemBank,
    scores: &ScoreMatrix,
    theta: &ThetaEstimates,
    parameters: Option<&[ItemParameters]>,
) -> ItemStatisticsTable {
    let (cronbach_alpha, alpha_if_deleted) = reliability(scores);

    let items = bank
        .items()
        .par_iter()
        .enumerate()
        .map(|(j, item)| {
            let mut score_vals = Vec::new();
            let mut theta_vals = Vec::new();
            let mut score_f = Vec::new();
            for i in 0..scores.n_persons() {
                if let (Some(s), Some(t)) = (scores.get(i, j), theta.get(i)) {
                    score_vals.push(s);
                    score_f.push(f64::from(s));
                    theta_vals.push(t);
                }
            }

            let max_score = item.max_score();
            let average_correct = mean(&score_f).ok().map(|m| m / f64::from(max_score));
            let correlation = match item.item_type {
                ItemType::Dichotomous => pearson(&score_f, &theta_vals),
                ItemType::Polytomous => polyserial(&theta_vals, &score_vals),
            };
            let theta_score_correlation = defined(correlation, &item.id, "theta_score_correlation");

            let params = parameters.and_then(|p| p.get(j));
            let (infit, outfit) = params
                .map(|p| fit_mean_squares(&score_vals, &theta_vals, &p.steps))
                .unwrap_or((None, None));

            ItemStatistic {
                item_id: item.id.clone(),
                item_type: item.item_type,
                max_score,
                number_exposures: score_vals.len(),
                average_correct,
                score_sd: sample_sd(&score_f).ok(),
                theta_score_correlation,
                alpha_if_deleted: alpha_if_deleted.get(j).copied().flatten(),
                difficulty: params.map(|p| p.difficulty),
                infit,
                outfit,
            }
        })
        .collect();

    ItemStatisticsTable {
        items,
        cronbach_alpha,
    }
}

/// Option-level statistics for every distinct observed response value.
pub fn option_statistics(
    bank: &ItemBank,
    responses: &ResponseData,
    theta: &ThetaEstimates,
) -> OptionStatisticsTable {
    let options = bank
        .items()
        .par_iter()
        .enumerate()
        .flat_map_iter(|(j, item)| item_options(item, j, responses, theta))
        .collect();
    OptionStatisticsTable { options }
}

fn item_options(
    item: &Item,
    j: usize,
    responses: &ResponseData,
    theta: &ThetaEstimates,
) -> Vec<OptionStatistic> {
    // Everyone who answered the item is the reference group for every option.
    let mut answered: Vec<(&ResponseValue, f64)> = Vec::new();
    for i in 0..responses.n_persons() {
        if let (Some(value), Some(t)) = (responses.response(i, j), theta.get(i)) {
            answered.push((value, t));
        }
    }
    let exposures = answered.len();
    let theta_all: Vec<f64> = answered.iter().map(|(_, t)| *t).collect();

    let mut groups: BTreeMap<&ResponseValue, Vec<f64>> = BTreeMap::new();
    for (value, t) in &answered {
        groups.entry(*value).or_default().push(*t);
    }

    groups
        .into_iter()
        .map(|(value, group_theta)| {
            let chose: Vec<bool> = answered.iter().map(|(v, _)| *v == value).collect();
            let correlation = defined(
                point_biserial(&chose, &theta_all),
                &item.id,
                "option correlation",
            );
            OptionStatistic {
                item_id: item.id.clone(),
                response: value.clone(),
                keyed: if *value == item.key {
                    Keyed::Key
                } else {
                    Keyed::Distractor
                },
                response_count: group_theta.len(),
                relative_freq: group_theta.len() as f64 / exposures as f64,
                avg_theta: mean(&group_theta).ok(),
                sd_theta: sample_sd(&group_theta).ok(),
                correlation,
            }
        })
        .collect()
}

fn defined(value: Result<f64, UndefinedStatistic>, item: &str, what: &str) -> Option<f64> {
    match value {
        Ok(v) => Some(v),
        Err(reason) => {
            debug!(item, statistic = what, %reason, "statistic undefined");
            None
        }
    }
}

/// Rasch infit and outfit mean squares from EAP theta.
fn fit_mean_squares(scores: &[i32], theta: &[f64], steps: &[f64]) -> (Option<f64>, Option<f64>) {
    let mut infit_num = 0.0;
    let mut infit_denom = 0.0;
    let mut outfit_sum = 0.0;
    let mut outfit_count = 0usize;

    for (&x, &t) in scores.iter().zip(theta) {
        let (expected, variance) = expected_score_and_variance(t, steps);
        let residual = f64::from(x) - expected;
        infit_num += residual * residual;
        infit_denom += variance;
        if variance > EPSILON {
            outfit_sum += residual * residual / variance;
            outfit_count += 1;
        }
    }

    let infit = (infit_denom > EPSILON).then(|| infit_num / infit_denom);
    let outfit = (outfit_count > 0).then(|| outfit_sum / outfit_count as f64);
    (infit, outfit)
}

/// Cronbach's alpha over complete cases, overall and with each item removed.
fn reliability(scores: &ScoreMatrix) -> (Option<f64>, Vec<Option<f64>>) {
    let n_items = scores.n_items();
    let complete: Vec<usize> = (0..scores.n_persons())
        .filter(|&i| scores.answered_count(i) == n_items)
        .collect();
    let columns: Vec<Vec<f64>> = (0..n_items)
        .map(|j| {
            complete
                .iter()
                .filter_map(|&i| scores.get(i, j))
                .map(f64::from)
                .collect()
        })
        .collect();

    let all: Vec<usize> = (0..n_items).collect();
    let overall = cronbach_alpha(&columns, &all).ok();
    let if_deleted = (0..n_items)
        .map(|j| {
            let rest: Vec<usize> = all.iter().copied().filter(|&k| k != j).collect();
            cronbach_alpha(&columns, &rest).ok()
        })
        .collect();
    (overall, if_deleted)
}

fn cronbach_alpha(columns: &[Vec<f64>], include: &[usize]) -> Result<f64, UndefinedStatistic> {
    if include.len() < 2 {
        return Err(UndefinedStatistic::TooFewObservations { required: 2 });
    }
    let n = include
        .first()
        .map(|&j| columns[j].len())
        .unwrap_or_default();
    let totals: Vec<f64> = (0..n)
        .map(|i| include.iter().map(|&j| columns[j][i]).sum())
        .collect();
    let total_var = sample_sd(&totals)?.powi(2);
    if total_var <= EPSILON {
        return Err(UndefinedStatistic::ZeroVariance);
    }
    let item_var: f64 = include
        .iter()
        .map(|&j| sample_sd(&columns[j]).map(|sd| sd * sd))
        .sum::<Result<f64, _>>()?;
    let k = include.len() as f64;
    Ok(k / (k - 1.0) * (1.0 - item_var / total_var))
}

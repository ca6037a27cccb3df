//! Latent trait estimation.
//!
//! Marginal maximum likelihood EM for the unidimensional Rasch-family model
//! (dichotomous Rasch plus partial credit), followed by EAP scoring. The fit
//! is one coupled optimisation over all items and persons; only the E-step
//! (per person) and the M-step (per item) are parallelised.

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EstimationConfig;
use crate::error::ModelFitError;
use crate::polytomous::{exceedance_probabilities, pcm_log_probabilities, pcm_probabilities};
use crate::scoring::{ScoreMatrix, MISSING};
use crate::utils::{
    compute_log_weights, gauss_hermite_quadrature, logsumexp, solve_linear_system, EPSILON,
};

const STEP_BOUND: f64 = 6.0;
const RIDGE: f64 = 0.01;
const MAX_NEWTON_DELTA: f64 = 1.0;
const LATENT_SD_BOUNDS: (f64, f64) = (0.2, 5.0);

/// Per-person ability estimates, indexed by person row.
///
/// Persons without any non-missing score get `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThetaEstimates {
    pub theta: Vec<Option<f64>>,
    pub se: Vec<Option<f64>>,
}

impl ThetaEstimates {
    pub fn len(&self) -> usize {
        self.theta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.is_empty()
    }

    pub fn get(&self, person: usize) -> Option<f64> {
        self.theta.get(person).copied().flatten()
    }

    pub fn n_estimated(&self) -> usize {
        self.theta.iter().filter(|t| t.is_some()).count()
    }
}

/// Fitted parameters of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemParameters {
    pub item_id: String,
    /// Step difficulties `δ_1..δ_m`.
    pub steps: Vec<f64>,
    /// Mean of the step difficulties.
    pub difficulty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDiagnostics {
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    pub latent_sd: f64,
    pub n_respondents: usize,
    pub n_parameters: usize,
    pub aic: f64,
    pub bic: f64,
    pub items: Vec<ItemParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitResult {
    pub theta: ThetaEstimates,
    pub diagnostics: ModelDiagnostics,
}

/// Fit the model to a score matrix and return EAP theta with posterior SDs.
pub fn fit(scores: &ScoreMatrix, config: &EstimationConfig) -> Result<FitResult, ModelFitError> {
    check_fittable(scores)?;

    let matrix = scores.view();
    let n_items = scores.n_items();
    let respondents: Vec<usize> = (0..scores.n_persons())
        .filter(|&i| scores.answered_count(i) > 0)
        .collect();
    if respondents.is_empty() {
        return Err(ModelFitError::NoRespondents);
    }
    let n_resp = respondents.len();

    let (nodes, quad_weights) = gauss_hermite_quadrature(config.n_quadpts);
    let log_weights = compute_log_weights(&quad_weights);
    let n_quad = nodes.len();

    let mut steps = initial_steps(scores, &respondents);
    let mut latent_sd = 1.0;

    let mut prev_ll = f64::NEG_INFINITY;
    let mut last_change = f64::INFINITY;
    let mut converged = false;
    let mut iteration = 0;
    let mut posterior: Vec<Vec<f64>> = Vec::new();
    let mut log_likelihood = f64::NEG_INFINITY;

    info!(
        persons = n_resp,
        items = n_items,
        quadpts = n_quad,
        "fitting Rasch-family model"
    );

    for iter in 0..config.max_iter {
        iteration = iter + 1;

        let theta_points: Vec<f64> = nodes.iter().map(|&z| z * latent_sd).collect();
        let (post, marginal) = e_step(matrix, &respondents, &theta_points, &log_weights, &steps);
        let current_ll: f64 = marginal.iter().sum();
        if !current_ll.is_finite() {
            return Err(ModelFitError::NonFinite(iteration));
        }
        posterior = post;
        log_likelihood = current_ll;

        last_change = (current_ll - prev_ll).abs();
        debug!(iteration, log_likelihood = current_ll, change = last_change, "EM iteration");
        if last_change < config.tol {
            converged = true;
            break;
        }
        prev_ll = current_ll;

        steps = m_step(
            matrix,
            &respondents,
            &posterior,
            &theta_points,
            &steps,
            config.newton_steps,
        );

        if config.estimate_latent_sd {
            latent_sd = update_latent_sd(&posterior, &theta_points)
                .clamp(LATENT_SD_BOUNDS.0, LATENT_SD_BOUNDS.1);
        }
    }

    if !converged {
        warn!(iterations = iteration, last_change, "EM hit max_iter without converging");
        return Err(ModelFitError::NotConverged {
            iterations: iteration,
            last_change,
        });
    }

    for (j, item_steps) in steps.iter().enumerate() {
        if item_steps.iter().any(|d| d.abs() >= STEP_BOUND - EPSILON) {
            warn!(item = %scores.item_ids()[j], "step parameter reached its bound");
        }
    }

    let theta_points: Vec<f64> = nodes.iter().map(|&z| z * latent_sd).collect();
    let mut theta = vec![None; scores.n_persons()];
    let mut se = vec![None; scores.n_persons()];
    for (post, &i) in posterior.iter().zip(&respondents) {
        let (eap, psd) = posterior_moments(post, &theta_points);
        theta[i] = Some(eap);
        se[i] = Some(psd);
    }

    let n_parameters = steps.iter().map(Vec::len).sum::<usize>()
        + usize::from(config.estimate_latent_sd);
    let k = n_parameters as f64;
    let aic = -2.0 * log_likelihood + 2.0 * k;
    let bic = -2.0 * log_likelihood + k * (n_resp as f64).ln();

    let items = scores
        .item_ids()
        .iter()
        .zip(steps)
        .map(|(id, item_steps)| ItemParameters {
            item_id: id.clone(),
            difficulty: item_steps.iter().sum::<f64>() / item_steps.len().max(1) as f64,
            steps: item_steps,
        })
        .collect();

    info!(iterations = iteration, log_likelihood, latent_sd, "model converged");

    Ok(FitResult {
        theta: ThetaEstimates { theta, se },
        diagnostics: ModelDiagnostics {
            log_likelihood,
            iterations: iteration,
            converged,
            latent_sd,
            n_respondents: n_resp,
            n_parameters,
            aic,
            bic,
            items,
        },
    })
}

/// EAP scores for every person given fixed item step parameters.
pub fn eap_scores(
    scores: &ScoreMatrix,
    steps: &[Vec<f64>],
    latent_sd: f64,
    n_quadpts: usize,
) -> Result<ThetaEstimates, ModelFitError> {
    if steps.len() != scores.n_items() {
        return Err(ModelFitError::ParameterMismatch {
            expected: scores.n_items(),
            found: steps.len(),
        });
    }
    for (j, item_steps) in steps.iter().enumerate() {
        let max_score = item_steps.len() as i32;
        if let Some(&score) = scores
            .column(j)
            .iter()
            .find(|&&s| s != MISSING && !(0..=max_score).contains(&s))
        {
            return Err(ModelFitError::ScoreOutOfRange {
                item: scores.item_ids()[j].clone(),
                score,
                max_score,
            });
        }
    }

    let (nodes, quad_weights) = gauss_hermite_quadrature(n_quadpts);
    let log_weights = compute_log_weights(&quad_weights);
    let theta_points: Vec<f64> = nodes.iter().map(|&z| z * latent_sd).collect();
    let respondents: Vec<usize> = (0..scores.n_persons())
        .filter(|&i| scores.answered_count(i) > 0)
        .collect();

    let (posterior, _) = e_step(scores.view(), &respondents, &theta_points, &log_weights, steps);

    let mut theta = vec![None; scores.n_persons()];
    let mut se = vec![None; scores.n_persons()];
    for (post, &i) in posterior.iter().zip(&respondents) {
        let (eap, psd) = posterior_moments(post, &theta_points);
        theta[i] = Some(eap);
        se[i] = Some(psd);
    }
    Ok(ThetaEstimates { theta, se })
}

fn check_fittable(scores: &ScoreMatrix) -> Result<(), ModelFitError> {
    if scores.n_persons() == 0 {
        return Err(ModelFitError::NoPersons);
    }
    if scores.n_items() == 0 {
        return Err(ModelFitError::NoItems);
    }

    for j in 0..scores.n_items() {
        let item = &scores.item_ids()[j];
        let max_score = scores.max_scores()[j];
        let mut first: Option<i32> = None;
        let mut varies = false;
        for &s in scores.column(j).iter() {
            if s == MISSING {
                continue;
            }
            if s < 0 || s > max_score {
                return Err(ModelFitError::ScoreOutOfRange {
                    item: item.clone(),
                    score: s,
                    max_score,
                });
            }
            match first {
                None => first = Some(s),
                Some(f) if f != s => varies = true,
                Some(_) => {}
            }
        }
        match first {
            None => return Err(ModelFitError::EmptyItem(item.clone())),
            Some(score) if !varies => {
                return Err(ModelFitError::ZeroVariance {
                    item: item.clone(),
                    score,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Starting steps from classical proportions: `δ_h = -logit(P(X ≥ h))`.
fn initial_steps(scores: &ScoreMatrix, respondents: &[usize]) -> Vec<Vec<f64>> {
    let matrix = scores.view();
    scores
        .max_scores()
        .iter()
        .enumerate()
        .map(|(j, &max_score)| {
            let m = max_score.max(1) as usize;
            let mut at_least = vec![0.0_f64; m];
            let mut count = 0.0_f64;
            for &i in respondents {
                let s = matrix[[i, j]];
                if s == MISSING {
                    continue;
                }
                count += 1.0;
                for h in 1..=(s as usize).min(m) {
                    at_least[h - 1] += 1.0;
                }
            }
            at_least
                .iter()
                .map(|&c| {
                    let p = (c / count.max(1.0)).clamp(0.01, 0.99);
                    (-(p / (1.0 - p)).ln()).clamp(-STEP_BOUND, STEP_BOUND)
                })
                .collect()
        })
        .collect()
}

/// `log P(X_j = k | θ_q)` for every item, node and category.
fn category_log_prob_table(theta_points: &[f64], steps: &[Vec<f64>]) -> Vec<Vec<Vec<f64>>> {
    steps
        .iter()
        .map(|item_steps| {
            theta_points
                .iter()
                .map(|&theta| pcm_log_probabilities(theta, item_steps))
                .collect()
        })
        .collect()
}

/// Posterior weights over nodes per respondent and each respondent's log marginal.
fn e_step(
    matrix: &Array2<i32>,
    respondents: &[usize],
    theta_points: &[f64],
    log_weights: &[f64],
    steps: &[Vec<f64>],
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let table = category_log_prob_table(theta_points, steps);
    let n_quad = theta_points.len();

    let results: Vec<(Vec<f64>, f64)> = respondents
        .par_iter()
        .map(|&i| {
            let row = matrix.row(i);
            let mut log_joint = log_weights.to_vec();
            for (j, &resp) in row.iter().enumerate() {
                if resp == MISSING {
                    continue;
                }
                let k = resp as usize;
                for (q, lj) in log_joint.iter_mut().enumerate().take(n_quad) {
                    *lj += table[j][q][k];
                }
            }

            let log_marginal = logsumexp(&log_joint);
            let posterior: Vec<f64> = log_joint
                .iter()
                .map(|&lj| (lj - log_marginal).exp())
                .collect();
            (posterior, log_marginal)
        })
        .collect();

    results.into_iter().unzip()
}

/// Newton updates of each item's steps against its expected category counts.
fn m_step(
    matrix: &Array2<i32>,
    respondents: &[usize],
    posterior: &[Vec<f64>],
    theta_points: &[f64],
    steps: &[Vec<f64>],
    newton_steps: usize,
) -> Vec<Vec<f64>> {
    let n_quad = theta_points.len();

    (0..steps.len())
        .into_par_iter()
        .map(|j| {
            let m = steps[j].len();
            // expected[q][k]: posterior-weighted count of score k at node q.
            let mut expected = vec![vec![0.0; m + 1]; n_quad];
            for (post, &i) in posterior.iter().zip(respondents) {
                let resp = matrix[[i, j]];
                if resp == MISSING {
                    continue;
                }
                let k = resp as usize;
                for q in 0..n_quad {
                    expected[q][k] += post[q];
                }
            }
            let totals: Vec<f64> = expected.iter().map(|row| row.iter().sum()).collect();
            let observed_at_least: Vec<Vec<f64>> = expected
                .iter()
                .map(|row| exceedance_probabilities(row))
                .collect();

            let mut delta = Array1::from(steps[j].clone());
            for _ in 0..newton_steps {
                let mut grad = Array1::<f64>::zeros(m);
                let mut hess = Array2::<f64>::zeros((m, m));

                for q in 0..n_quad {
                    if totals[q] < EPSILON {
                        continue;
                    }
                    let probs = pcm_probabilities(theta_points[q], delta.as_slice().unwrap_or(&[]));
                    let exceed = exceedance_probabilities(&probs);
                    for h in 0..m {
                        grad[h] += totals[q] * exceed[h] - observed_at_least[q][h];
                        for l in 0..m {
                            let joint = exceed[h.max(l)];
                            hess[[h, l]] -= totals[q] * (joint - exceed[h] * exceed[l]);
                        }
                    }
                }
                for h in 0..m {
                    grad[h] -= RIDGE * delta[h];
                    hess[[h, h]] -= RIDGE;
                }

                let Some(direction) = solve_linear_system(hess, grad) else {
                    break;
                };
                let largest = direction.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
                let scale = if largest > MAX_NEWTON_DELTA {
                    MAX_NEWTON_DELTA / largest
                } else {
                    1.0
                };
                for h in 0..m {
                    delta[h] = (delta[h] - scale * direction[h]).clamp(-STEP_BOUND, STEP_BOUND);
                }
                if largest * scale < 1e-6 {
                    break;
                }
            }
            delta.to_vec()
        })
        .collect()
}

fn update_latent_sd(posterior: &[Vec<f64>], theta_points: &[f64]) -> f64 {
    let n = posterior.len().max(1) as f64;
    let second_moment: f64 = posterior
        .iter()
        .map(|post| {
            post.iter()
                .zip(theta_points)
                .map(|(&p, &t)| p * t * t)
                .sum::<f64>()
        })
        .sum();
    (second_moment / n).sqrt()
}

fn posterior_moments(posterior: &[f64], theta_points: &[f64]) -> (f64, f64) {
    let eap: f64 = posterior
        .iter()
        .zip(theta_points)
        .map(|(&p, &theta)| p * theta)
        .sum();
    let psd = posterior
        .iter()
        .zip(theta_points)
        .map(|(&p, &theta)| p * (theta - eap).powi(2))
        .sum::<f64>()
        .sqrt();
    (eap, psd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<Vec<i32>>, max_scores: Vec<i32>) -> ScoreMatrix {
        let n = rows.len();
        let m = max_scores.len();
        let flat: Vec<i32> = rows.into_iter().flatten().collect();
        let ids = (0..m).map(|j| format!("i{j}")).collect();
        ScoreMatrix::from_parts(ids, max_scores, Array2::from_shape_vec((n, m), flat).unwrap())
    }

    fn guttman(n_items: usize) -> ScoreMatrix {
        // Person i answers the i easiest items correctly, with one reversal per
        // row so no item is perfectly separated.
        let mut rows = Vec::new();
        for total in 0..=n_items {
            for rep in 0..3 {
                let mut row: Vec<i32> = (0..n_items).map(|j| i32::from(j < total)).collect();
                if rep == 1 && total > 0 && total < n_items {
                    row.swap(total - 1, total);
                }
                rows.push(row);
            }
        }
        matrix(rows, vec![1; n_items])
    }

    #[test]
    fn higher_raw_score_means_higher_theta() {
        let scores = guttman(5);
        let fit = fit(&scores, &EstimationConfig::default()).unwrap();
        assert!(fit.diagnostics.converged);
        let low = fit.theta.get(0).unwrap();
        let high = fit.theta.get(scores.n_persons() - 1).unwrap();
        assert!(high > low, "high={high} low={low}");
        assert!(fit.theta.se.iter().all(|s| s.is_some_and(|v| v > 0.0)));
    }

    #[test]
    fn easier_items_get_lower_difficulty() {
        let fit = fit(&guttman(5), &EstimationConfig::default()).unwrap();
        let d: Vec<f64> = fit.diagnostics.items.iter().map(|p| p.difficulty).collect();
        assert!(d.windows(2).all(|w| w[0] < w[1]), "difficulties {d:?}");
    }

    #[test]
    fn zero_variance_column_fails() {
        let scores = matrix(vec![vec![1, 0], vec![1, 1], vec![1, 0]], vec![1, 1]);
        let err = fit(&scores, &EstimationConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ModelFitError::ZeroVariance {
                item: "i0".into(),
                score: 1
            }
        );
    }

    #[test]
    fn empty_column_fails() {
        let scores = matrix(vec![vec![MISSING, 0], vec![MISSING, 1]], vec![1, 1]);
        assert_eq!(
            fit(&scores, &EstimationConfig::default()).unwrap_err(),
            ModelFitError::EmptyItem("i0".into())
        );
    }

    #[test]
    fn out_of_range_score_fails() {
        let scores = matrix(vec![vec![2, 0], vec![0, 1]], vec![1, 1]);
        assert!(matches!(
            fit(&scores, &EstimationConfig::default()),
            Err(ModelFitError::ScoreOutOfRange { .. })
        ));
    }

    #[test]
    fn empty_matrix_fails() {
        let scores = ScoreMatrix::from_parts(vec![], vec![], Array2::zeros((0, 0)));
        assert_eq!(
            fit(&scores, &EstimationConfig::default()).unwrap_err(),
            ModelFitError::NoPersons
        );
    }

    #[test]
    fn non_convergence_is_an_error() {
        let config = EstimationConfig {
            max_iter: 1,
            ..EstimationConfig::default()
        };
        assert!(matches!(
            fit(&guttman(4), &config),
            Err(ModelFitError::NotConverged { iterations: 1, .. })
        ));
    }

    #[test]
    fn person_without_responses_gets_no_theta() {
        let mut rows = Vec::new();
        for r in 0..12 {
            rows.push(vec![r % 2, (r / 2) % 2, i32::from(r > 5)]);
        }
        rows.push(vec![MISSING, MISSING, MISSING]);
        let scores = matrix(rows, vec![1, 1, 1]);
        let fit = fit(&scores, &EstimationConfig::default()).unwrap();
        assert_eq!(fit.theta.len(), 13);
        assert_eq!(fit.theta.get(12), None);
        assert_eq!(fit.theta.n_estimated(), 12);
        assert_eq!(fit.diagnostics.n_respondents, 12);
    }

    #[test]
    fn mixed_item_types_fit_together() {
        let mut rows = Vec::new();
        for total in 0..12 {
            let poly = (total / 3).min(3);
            rows.push(vec![i32::from(total > 3), i32::from(total > 7), poly]);
        }
        rows[2][0] = 1;
        rows[9][1] = 0;
        rows[5][2] = 0;
        let scores = matrix(rows, vec![1, 1, 3]);
        let fit = fit(&scores, &EstimationConfig::default()).unwrap();
        assert_eq!(fit.diagnostics.items[2].steps.len(), 3);
        assert_eq!(fit.diagnostics.n_parameters, 5);
        let first = fit.theta.get(0).unwrap();
        let last = fit.theta.get(11).unwrap();
        assert!(last > first);
    }

    #[test]
    fn refitting_is_deterministic() {
        let scores = guttman(4);
        let a = fit(&scores, &EstimationConfig::default()).unwrap();
        let b = fit(&scores, &EstimationConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn eap_scores_match_fit_output() {
        let scores = guttman(4);
        let config = EstimationConfig::default();
        let fitted = fit(&scores, &config).unwrap();
        let steps: Vec<Vec<f64>> = fitted
            .diagnostics
            .items
            .iter()
            .map(|p| p.steps.clone())
            .collect();
        let rescored =
            eap_scores(&scores, &steps, fitted.diagnostics.latent_sd, config.n_quadpts).unwrap();
        for (a, b) in rescored.theta.iter().zip(&fitted.theta.theta) {
            assert!((a.unwrap() - b.unwrap()).abs() < 1e-2);
        }
    }

    #[test]
    fn eap_scores_reject_parameters_that_do_not_fit_the_matrix() {
        let scores = guttman(4);
        let too_few = vec![vec![0.0]; 3];
        let err = eap_scores(&scores, &too_few, 1.0, 21).unwrap_err();
        assert_eq!(
            err,
            ModelFitError::ParameterMismatch {
                expected: 4,
                found: 3
            }
        );

        let poly = matrix(vec![vec![2, 0], vec![1, 1], vec![0, MISSING]], vec![2, 1]);
        let err = eap_scores(&poly, &[vec![0.0], vec![0.0]], 1.0, 21).unwrap_err();
        assert_eq!(
            err,
            ModelFitError::ScoreOutOfRange {
                item: "i0".into(),
                score: 2,
                max_score: 1
            }
        );
        assert!(eap_scores(&poly, &[vec![-0.5, 0.5], vec![0.0]], 1.0, 21).is_ok());
    }

    #[test]
    fn latent_sd_can_be_estimated() {
        let config = EstimationConfig {
            estimate_latent_sd: true,
            max_iter: 5000,
            ..EstimationConfig::default()
        };
        let fit = fit(&guttman(6), &config).unwrap();
        let sd = fit.diagnostics.latent_sd;
        assert!((LATENT_SD_BOUNDS.0..=LATENT_SD_BOUNDS.1).contains(&sd));
        assert_eq!(fit.diagnostics.n_parameters, 7);
    }

    #[test]
    fn posterior_moments_of_point_mass() {
        let (eap, psd) = posterior_moments(&[0.0, 1.0, 0.0], &[-1.0, 0.5, 1.0]);
        assert!((eap - 0.5).abs() < 1e-12);
        assert!(psd.abs() < 1e-12);
    }
}

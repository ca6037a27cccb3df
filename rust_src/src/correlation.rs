//! Descriptive and correlational statistics over paired observations.
//!
//! Everything returns [`UndefinedStatistic`] rather than a default value when
//! the data cannot support the statistic.

use crate::error::UndefinedStatistic;
use crate::utils::{normal_pdf, normal_quantile};

const VARIANCE_FLOOR: f64 = 1e-12;

pub fn mean(values: &[f64]) -> Result<f64, UndefinedStatistic> {
    if values.is_empty() {
        return Err(UndefinedStatistic::TooFewObservations { required: 1 });
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_sd(values: &[f64]) -> Result<f64, UndefinedStatistic> {
    if values.len() < 2 {
        return Err(UndefinedStatistic::TooFewObservations { required: 2 });
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|x| (x - m).powi(2)).sum();
    Ok((ss / (values.len() - 1) as f64).sqrt())
}

/// Pearson product-moment correlation.
pub fn pearson(x: &[f64], y: &[f64]) -> Result<f64, UndefinedStatistic> {
    let n = x.len().min(y.len());
    if n < 2 {
        return Err(UndefinedStatistic::TooFewObservations { required: 2 });
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mx = mean(x)?;
    let my = mean(y)?;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (&a, &b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    if sxx <= VARIANCE_FLOOR || syy <= VARIANCE_FLOOR {
        return Err(UndefinedStatistic::ZeroVariance);
    }
    Ok((sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0))
}

/// Point-biserial correlation of a 0/1 indicator with a continuous variable.
pub fn point_biserial(indicator: &[bool], continuous: &[f64]) -> Result<f64, UndefinedStatistic> {
    let coded: Vec<f64> = indicator.iter().map(|&b| f64::from(u8::from(b))).collect();
    pearson(&coded, continuous)
}

/// Two-step polyserial correlation between a continuous variable and an
/// ordinal score.
///
/// `r_ps = r_xy * s_y / Σ φ(τ_k) (y_{k+1} - y_k)`, where `τ_k` are normal
/// quantiles of the cumulative proportions of the observed score levels.
pub fn polyserial(continuous: &[f64], ordinal: &[i32]) -> Result<f64, UndefinedStatistic> {
    let n = continuous.len().min(ordinal.len());
    let ordinal_f: Vec<f64> = ordinal[..n].iter().map(|&s| f64::from(s)).collect();
    let r = pearson(&continuous[..n], &ordinal_f)?;
    let s_y = population_sd(&ordinal_f);

    let mut levels: Vec<i32> = ordinal[..n].to_vec();
    levels.sort_unstable();
    let mut denom = 0.0;
    let mut cumulative = 0usize;
    let mut idx = 0;
    while idx < levels.len() {
        let level = levels[idx];
        let run = levels[idx..].iter().take_while(|&&l| l == level).count();
        cumulative += run;
        idx += run;
        if let Some(&next) = levels.get(idx) {
            let tau = normal_quantile(cumulative as f64 / n as f64);
            denom += normal_pdf(tau) * f64::from(next - level);
        }
    }
    if denom <= VARIANCE_FLOOR {
        return Err(UndefinedStatistic::ZeroVariance);
    }
    Ok((r * s_y / denom).clamp(-1.0, 1.0))
}

fn population_sd(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let m = values.iter().sum::<f64>() / n;
    (values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n).sqrt()
}

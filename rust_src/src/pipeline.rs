//! End-to-end analysis run: score, fit, describe, flag.
//!
//! Each stage consumes the whole output of the one before it. Integrity and
//! model-fit errors abort the run before any statistics are computed.

use serde::Serialize;
use tracing::{info, info_span};

use crate::config::AnalysisConfig;
use crate::data::{ItemBank, ResponseData};
use crate::error::{ItemAnalysisError, Result};
use crate::estimation::{self, ModelDiagnostics, ThetaEstimates};
use crate::flags::{self, FlagReport};
use crate::response_time::ResponseTimes;
use crate::scoring::ScoreMatrix;
use crate::statistics::{self, ItemStatisticsTable, OptionStatisticsTable};

/// Everything one run produces, ready for rendering or JSON export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub person_labels: Vec<String>,
    pub scores: ScoreMatrix,
    pub theta: ThetaEstimates,
    pub diagnostics: ModelDiagnostics,
    pub item_statistics: ItemStatisticsTable,
    pub option_statistics: OptionStatisticsTable,
    pub flags: FlagReport,
}

impl AnalysisReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ItemAnalysisError::InvalidInput(format!("report serialization: {e}")))
    }
}

pub fn analyze(
    bank: &ItemBank,
    responses: &ResponseData,
    times: &ResponseTimes,
    config: &AnalysisConfig,
) -> Result<AnalysisReport> {
    config.validate()?;
    if responses.n_items() != bank.len() {
        return Err(ItemAnalysisError::InvalidInput(format!(
            "responses have {} item columns for a bank of {} items",
            responses.n_items(),
            bank.len()
        )));
    }
    let n_examinees = responses.n_persons();

    let scores = {
        let _span = info_span!("scoring").entered();
        let scores = ScoreMatrix::from_responses(bank, responses);
        info!(persons = n_examinees, items = bank.len(), "scored responses");
        scores
    };

    let fitted = {
        let _span = info_span!("estimation").entered();
        estimation::fit(&scores, &config.estimation)?
    };

    let (item_statistics, option_statistics) = {
        let _span = info_span!("statistics").entered();
        let items = statistics::item_statistics(
            bank,
            &scores,
            &fitted.theta,
            Some(fitted.diagnostics.items.as_slice()),
        );
        let options = statistics::option_statistics(bank, responses, &fitted.theta);
        info!(
            items = items.items.len(),
            options = options.options.len(),
            alpha = ?items.cronbach_alpha,
            "computed item and option statistics"
        );
        (items, options)
    };

    let flags = {
        let _span = info_span!("flags").entered();
        let report = flags::evaluate(
            &item_statistics,
            &option_statistics,
            times,
            n_examinees,
            &config.thresholds,
            &config.tiers,
        );
        info!(
            tier = ?report.tier,
            active_rules = report.active_rules.len(),
            flagged = report.rows.len(),
            "evaluated flag rules"
        );
        report
    };

    Ok(AnalysisReport {
        person_labels: responses.labels().to_vec(),
        scores,
        theta: fitted.theta,
        diagnostics: fitted.diagnostics,
        item_statistics,
        option_statistics,
        flags,
    })
}

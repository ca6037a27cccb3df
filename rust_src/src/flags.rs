//! Flag rules over item and option statistics.
//!
//! Each rule is an independent predicate in [`REGISTRY`]. The sample size
//! selects which rules are active; inactive rules are never evaluated and do
//! not appear in the report. A predicate returns `None` when a statistic it
//! needs is missing, and that counts as [`Flag::Normal`].

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{FlagThresholds, SampleTiers};
use crate::response_time::ResponseTimes;
use crate::statistics::{ItemStatistic, ItemStatisticsTable, OptionStatistic, OptionStatisticsTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    LowKeyedCorrelation,
    HighDistractorCorrelation,
    DistractorExceedsKey,
    LowProportionLowCorrelationKey,
    HighDistractorShareLowKeyCorrelation,
    SlowResponse,
}

impl RuleId {
    pub const ALL: [RuleId; 6] = [
        RuleId::LowKeyedCorrelation,
        RuleId::HighDistractorCorrelation,
        RuleId::DistractorExceedsKey,
        RuleId::LowProportionLowCorrelationKey,
        RuleId::HighDistractorShareLowKeyCorrelation,
        RuleId::SlowResponse,
    ];

    /// Short code, `R1`..`R6`.
    pub fn code(self) -> &'static str {
        match self {
            RuleId::LowKeyedCorrelation => "R1",
            RuleId::HighDistractorCorrelation => "R2",
            RuleId::DistractorExceedsKey => "R3",
            RuleId::LowProportionLowCorrelationKey => "R4",
            RuleId::HighDistractorShareLowKeyCorrelation => "R5",
            RuleId::SlowResponse => "R6",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RuleId::LowKeyedCorrelation => "low_keyed_correlation",
            RuleId::HighDistractorCorrelation => "high_distractor_correlation",
            RuleId::DistractorExceedsKey => "distractor_exceeds_key",
            RuleId::LowProportionLowCorrelationKey => "low_proportion_low_correlation_key",
            RuleId::HighDistractorShareLowKeyCorrelation => {
                "high_distractor_share_low_key_correlation"
            }
            RuleId::SlowResponse => "slow_response",
        }
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    Flag,
    Normal,
}

impl Flag {
    fn from_outcome(outcome: Option<bool>) -> Self {
        match outcome {
            Some(true) => Flag::Flag,
            _ => Flag::Normal,
        }
    }
}

/// Everything a rule may read about one item.
#[derive(Debug, Clone)]
pub struct ItemContext<'a> {
    pub item: &'a ItemStatistic,
    /// `None` when nobody gave the keyed response.
    pub key: Option<&'a OptionStatistic>,
    pub distractors: Vec<&'a OptionStatistic>,
    pub average_time: Option<f64>,
}

impl<'a> ItemContext<'a> {
    pub fn new(
        item: &'a ItemStatistic,
        options: &'a OptionStatisticsTable,
        times: &ResponseTimes,
    ) -> Self {
        Self {
            item,
            key: options.keyed_option(&item.item_id),
            distractors: options.distractors(&item.item_id).collect(),
            average_time: times.get(&item.item_id),
        }
    }

    fn key_correlation(&self) -> Option<f64> {
        self.key.and_then(|k| k.correlation)
    }
}

pub type Predicate = fn(&ItemContext<'_>, &FlagThresholds) -> Option<bool>;

pub struct Rule {
    pub id: RuleId,
    pub predicate: Predicate,
}

pub static REGISTRY: [Rule; 6] = [
    Rule {
        id: RuleId::LowKeyedCorrelation,
        predicate: low_keyed_correlation,
    },
    Rule {
        id: RuleId::HighDistractorCorrelation,
        predicate: high_distractor_correlation,
    },
    Rule {
        id: RuleId::DistractorExceedsKey,
        predicate: distractor_exceeds_key,
    },
    Rule {
        id: RuleId::LowProportionLowCorrelationKey,
        predicate: low_proportion_low_correlation_key,
    },
    Rule {
        id: RuleId::HighDistractorShareLowKeyCorrelation,
        predicate: high_distractor_share_low_key_correlation,
    },
    Rule {
        id: RuleId::SlowResponse,
        predicate: slow_response,
    },
];

pub fn rule(id: RuleId) -> &'static Rule {
    // REGISTRY is laid out in RuleId::ALL order.
    &REGISTRY[id as usize]
}

fn low_keyed_correlation(ctx: &ItemContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let r = ctx.key_correlation()?;
    let hard = ctx
        .item
        .average_correct
        .is_some_and(|p| p < t.low_key_average_correct);
    Some((r < t.low_key_correlation && hard) || r < t.negative_key_correlation)
}

fn high_distractor_correlation(ctx: &ItemContext<'_>, t: &FlagThresholds) -> Option<bool> {
    Some(ctx.distractors.iter().any(|d| {
        d.response_count > t.min_distractor_count
            && d.correlation.is_some_and(|r| r > t.distractor_correlation)
    }))
}

fn distractor_exceeds_key(ctx: &ItemContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let key_r = ctx.key_correlation()?;
    Some(ctx.distractors.iter().any(|d| {
        d.response_count > t.min_distractor_count && d.correlation.is_some_and(|r| r > key_r)
    }))
}

fn low_proportion_low_correlation_key(ctx: &ItemContext<'_>, t: &FlagThresholds) -> Option<bool> {
    let key = ctx.key?;
    let r = key.correlation?;
    Some(key.relative_freq < t.low_key_proportion && r < t.weak_key_correlation)
}

fn high_distractor_share_low_key_correlation(
    ctx: &ItemContext<'_>,
    t: &FlagThresholds,
) -> Option<bool> {
    let key_r = ctx.key_correlation()?;
    let dominant = ctx
        .distractors
        .iter()
        .any(|d| d.relative_freq > t.dominant_distractor_share);
    Some(dominant && key_r < t.weak_key_correlation)
}

fn slow_response(ctx: &ItemContext<'_>, t: &FlagThresholds) -> Option<bool> {
    Some(ctx.average_time? > t.max_average_time)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleTier {
    Small,
    Moderate,
    Large,
}

impl SampleTier {
    pub fn for_sample(n_examinees: usize, tiers: &SampleTiers) -> Self {
        if n_examinees <= tiers.small_max {
            SampleTier::Small
        } else if n_examinees <= tiers.moderate_max {
            SampleTier::Moderate
        } else {
            SampleTier::Large
        }
    }

    /// Rules trusted at this sample size, in registry order.
    pub fn rules(self) -> &'static [RuleId] {
        match self {
            SampleTier::Small => &[RuleId::LowProportionLowCorrelationKey],
            SampleTier::Moderate => &[
                RuleId::LowKeyedCorrelation,
                RuleId::LowProportionLowCorrelationKey,
                RuleId::SlowResponse,
            ],
            SampleTier::Large => &RuleId::ALL,
        }
    }
}

pub fn active_rules(n_examinees: usize, tiers: &SampleTiers) -> &'static [RuleId] {
    SampleTier::for_sample(n_examinees, tiers).rules()
}

pub fn evaluate_rule(id: RuleId, ctx: &ItemContext<'_>, thresholds: &FlagThresholds) -> Flag {
    Flag::from_outcome((rule(id).predicate)(ctx, thresholds))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagRow {
    pub item_id: String,
    /// One entry per rule in [`FlagReport::active_rules`].
    pub flags: Vec<Flag>,
}

/// Sparse flagged-item table: only items with at least one active flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagReport {
    pub n_examinees: usize,
    pub tier: SampleTier,
    pub active_rules: Vec<RuleId>,
    pub rows: Vec<FlagRow>,
}

impl FlagReport {
    pub fn row(&self, item_id: &str) -> Option<&FlagRow> {
        self.rows.iter().find(|r| r.item_id == item_id)
    }

    /// `None` if the item is not in the report or the rule was not active.
    pub fn flag(&self, item_id: &str, rule: RuleId) -> Option<Flag> {
        let col = self.active_rules.iter().position(|&r| r == rule)?;
        self.row(item_id).map(|row| row.flags[col])
    }

    pub fn is_flagged(&self, item_id: &str, rule: RuleId) -> bool {
        self.flag(item_id, rule) == Some(Flag::Flag)
    }

    pub fn flagged_items(&self) -> impl Iterator<Item = &str> + '_ {
        self.rows.iter().map(|r| r.item_id.as_str())
    }
}

pub fn evaluate(
    items: &ItemStatisticsTable,
    options: &OptionStatisticsTable,
    times: &ResponseTimes,
    n_examinees: usize,
    thresholds: &FlagThresholds,
    tiers: &SampleTiers,
) -> FlagReport {
    let tier = SampleTier::for_sample(n_examinees, tiers);
    let active = tier.rules();

    let rows = items
        .items
        .par_iter()
        .filter_map(|item| {
            let ctx = ItemContext::new(item, options, times);
            let flags: Vec<Flag> = active
                .iter()
                .map(|&id| evaluate_rule(id, &ctx, thresholds))
                .collect();
            flags.contains(&Flag::Flag).then(|| FlagRow {
                item_id: item.item_id.clone(),
                flags,
            })
        })
        .collect();

    FlagReport {
        n_examinees,
        tier,
        active_rules: active.to_vec(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ItemType, ResponseValue};
    use crate::statistics::Keyed;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn item(id: &str, average_correct: Option<f64>) -> ItemStatistic {
        ItemStatistic {
            item_id: id.into(),
            item_type: ItemType::Dichotomous,
            max_score: 1,
            number_exposures: 100,
            average_correct,
            score_sd: None,
            theta_score_correlation: None,
            alpha_if_deleted: None,
            difficulty: None,
            infit: None,
            outfit: None,
        }
    }

    fn option(
        id: &str,
        value: &str,
        keyed: Keyed,
        count: usize,
        freq: f64,
        correlation: Option<f64>,
    ) -> OptionStatistic {
        OptionStatistic {
            item_id: id.into(),
            response: ResponseValue::parse(value),
            keyed,
            response_count: count,
            relative_freq: freq,
            avg_theta: None,
            sd_theta: None,
            correlation,
        }
    }

    fn flag_of(
        id: RuleId,
        item: &ItemStatistic,
        options: &[OptionStatistic],
        time: Option<f64>,
    ) -> Flag {
        let table = OptionStatisticsTable {
            options: options.to_vec(),
        };
        let times = match time {
            Some(t) => ResponseTimes::from_averages([(item.item_id.clone(), t)]).unwrap(),
            None => ResponseTimes::new(),
        };
        let ctx = ItemContext::new(item, &table, &times);
        evaluate_rule(id, &ctx, &FlagThresholds::default())
    }

    #[test]
    fn registry_matches_rule_order() {
        for (i, id) in RuleId::ALL.iter().enumerate() {
            assert_eq!(REGISTRY[i].id, *id);
            assert_eq!(rule(*id).id, *id);
        }
        assert_eq!(RuleId::SlowResponse.code(), "R6");
        assert_eq!(
            serde_json::to_string(&RuleId::DistractorExceedsKey).unwrap(),
            "\"distractor_exceeds_key\""
        );
    }

    #[rstest]
    #[case(0, &[RuleId::LowProportionLowCorrelationKey])]
    #[case(10, &[RuleId::LowProportionLowCorrelationKey])]
    #[case(14, &[RuleId::LowProportionLowCorrelationKey])]
    #[case(15, &[RuleId::LowKeyedCorrelation, RuleId::LowProportionLowCorrelationKey, RuleId::SlowResponse])]
    #[case(49, &[RuleId::LowKeyedCorrelation, RuleId::LowProportionLowCorrelationKey, RuleId::SlowResponse])]
    #[case(50, &RuleId::ALL)]
    #[case(1000, &RuleId::ALL)]
    fn tiers_select_rules(#[case] n: usize, #[case] expected: &[RuleId]) {
        assert_eq!(active_rules(n, &SampleTiers::default()), expected);
    }

    #[rstest]
    #[case(Some(-0.05), Some(0.50), Flag::Flag)]
    #[case(Some(-0.05), Some(0.80), Flag::Normal)]
    #[case(Some(-0.20), Some(0.80), Flag::Flag)]
    #[case(Some(0.95), Some(0.50), Flag::Normal)]
    #[case(Some(-0.05), None, Flag::Normal)]
    #[case(None, Some(0.10), Flag::Normal)]
    fn low_keyed_correlation_cases(
        #[case] key_r: Option<f64>,
        #[case] p: Option<f64>,
        #[case] expected: Flag,
    ) {
        let it = item("q", p);
        let opts = [option("q", "a", Keyed::Key, 50, 0.5, key_r)];
        assert_eq!(flag_of(RuleId::LowKeyedCorrelation, &it, &opts, None), expected);
    }

    #[test]
    fn distractor_rules_need_enough_respondents() {
        let it = item("q", Some(0.5));
        let few = [
            option("q", "a", Keyed::Key, 40, 0.8, Some(0.02)),
            option("q", "c", Keyed::Distractor, 5, 0.1, Some(0.3)),
        ];
        assert_eq!(flag_of(RuleId::HighDistractorCorrelation, &it, &few, None), Flag::Normal);
        assert_eq!(flag_of(RuleId::DistractorExceedsKey, &it, &few, None), Flag::Normal);

        let many = [
            option("q", "a", Keyed::Key, 40, 0.8, Some(0.02)),
            option("q", "c", Keyed::Distractor, 6, 0.12, Some(0.3)),
        ];
        assert_eq!(flag_of(RuleId::HighDistractorCorrelation, &it, &many, None), Flag::Flag);
        assert_eq!(flag_of(RuleId::DistractorExceedsKey, &it, &many, None), Flag::Flag);
    }

    #[test]
    fn distractor_exceeds_key_is_normal_without_key_correlation() {
        let it = item("q", Some(0.5));
        let opts = [
            option("q", "a", Keyed::Key, 40, 0.8, None),
            option("q", "c", Keyed::Distractor, 10, 0.2, Some(0.3)),
        ];
        assert_eq!(flag_of(RuleId::DistractorExceedsKey, &it, &opts, None), Flag::Normal);
        assert_eq!(flag_of(RuleId::HighDistractorCorrelation, &it, &opts, None), Flag::Flag);
    }

    #[rstest]
    #[case(0.20, Some(0.05), Flag::Flag)]
    #[case(0.30, Some(0.05), Flag::Normal)]
    #[case(0.20, Some(0.40), Flag::Normal)]
    #[case(0.20, None, Flag::Normal)]
    fn low_proportion_key_cases(#[case] freq: f64, #[case] r: Option<f64>, #[case] expected: Flag) {
        let it = item("q", Some(freq));
        let opts = [option("q", "a", Keyed::Key, 10, freq, r)];
        assert_eq!(
            flag_of(RuleId::LowProportionLowCorrelationKey, &it, &opts, None),
            expected
        );
    }

    #[test]
    fn dominant_distractor_with_weak_key() {
        let it = item("q", Some(0.3));
        let opts = [
            option("q", "a", Keyed::Key, 30, 0.3, Some(0.05)),
            option("q", "b", Keyed::Distractor, 60, 0.6, Some(-0.1)),
            option("q", "c", Keyed::Distractor, 10, 0.1, Some(-0.2)),
        ];
        assert_eq!(
            flag_of(RuleId::HighDistractorShareLowKeyCorrelation, &it, &opts, None),
            Flag::Flag
        );
    }

    fn unkeyed_options() -> Vec<OptionStatistic> {
        vec![
            option("q", "b", Keyed::Distractor, 60, 0.6, Some(0.3)),
            option("q", "c", Keyed::Distractor, 30, 0.3, Some(0.2)),
        ]
    }

    #[rstest]
    #[case::dominant_distractor_without_key_correlation(
        RuleId::HighDistractorShareLowKeyCorrelation,
        vec![
            option("q", "a", Keyed::Key, 30, 0.3, None),
            option("q", "b", Keyed::Distractor, 60, 0.6, Some(-0.1)),
        ]
    )]
    #[case::distractor_without_correlation(
        RuleId::HighDistractorCorrelation,
        vec![
            option("q", "a", Keyed::Key, 40, 0.8, Some(0.4)),
            option("q", "c", Keyed::Distractor, 10, 0.2, None),
        ]
    )]
    #[case::no_key_low_keyed_correlation(RuleId::LowKeyedCorrelation, unkeyed_options())]
    #[case::no_key_distractor_exceeds_key(RuleId::DistractorExceedsKey, unkeyed_options())]
    #[case::no_key_low_proportion(RuleId::LowProportionLowCorrelationKey, unkeyed_options())]
    #[case::no_key_dominant_distractor(
        RuleId::HighDistractorShareLowKeyCorrelation,
        unkeyed_options()
    )]
    fn missing_inputs_are_normal(#[case] id: RuleId, #[case] opts: Vec<OptionStatistic>) {
        let it = item("q", Some(0.1));
        assert_eq!(flag_of(id, &it, &opts, None), Flag::Normal);
    }

    #[rstest]
    #[case(Some(121.0), Flag::Flag)]
    #[case(Some(120.0), Flag::Normal)]
    #[case(None, Flag::Normal)]
    fn slow_response_cases(#[case] time: Option<f64>, #[case] expected: Flag) {
        let it = item("q", Some(0.5));
        assert_eq!(flag_of(RuleId::SlowResponse, &it, &[], time), expected);
    }

    #[test]
    fn report_keeps_only_flagged_items_and_active_columns() {
        let items = ItemStatisticsTable {
            items: vec![
                item("good", Some(0.7)),
                item("slow", Some(0.7)),
                item("bad", Some(0.1)),
            ],
            cronbach_alpha: None,
        };
        let options = OptionStatisticsTable {
            options: vec![
                option("good", "a", Keyed::Key, 14, 0.7, Some(0.6)),
                option("slow", "a", Keyed::Key, 14, 0.7, Some(0.6)),
                option("bad", "a", Keyed::Key, 2, 0.1, Some(-0.3)),
            ],
        };
        let times = ResponseTimes::from_averages([("good", 30.0), ("slow", 300.0)]).unwrap();

        let moderate = evaluate(
            &items,
            &options,
            &times,
            20,
            &FlagThresholds::default(),
            &SampleTiers::default(),
        );
        assert_eq!(moderate.tier, SampleTier::Moderate);
        let flagged: Vec<&str> = moderate.flagged_items().collect();
        assert_eq!(flagged, vec!["slow", "bad"]);
        assert_eq!(moderate.flag("slow", RuleId::SlowResponse), Some(Flag::Flag));
        assert_eq!(moderate.flag("slow", RuleId::LowKeyedCorrelation), Some(Flag::Normal));
        assert!(moderate.is_flagged("bad", RuleId::LowKeyedCorrelation));
        assert!(moderate.is_flagged("bad", RuleId::LowProportionLowCorrelationKey));
        assert_eq!(moderate.flag("bad", RuleId::DistractorExceedsKey), None);

        let small = evaluate(
            &items,
            &options,
            &times,
            10,
            &FlagThresholds::default(),
            &SampleTiers::default(),
        );
        assert_eq!(small.active_rules, vec![RuleId::LowProportionLowCorrelationKey]);
        assert_eq!(small.flagged_items().collect::<Vec<_>>(), vec!["bad"]);
        assert_eq!(small.rows[0].flags, vec![Flag::Flag]);
    }
}

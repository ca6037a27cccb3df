//! Response scoring.
//!
//! One rule covers dichotomous and polytomous items: credit each selected key
//! symbol, debit each selected non-key symbol, floor at zero.

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::Serialize;

use crate::data::{ItemBank, ResponseData, ResponseValue};

/// Marker stored in a [`ScoreMatrix`] for a missing response.
pub const MISSING: i32 = -1;

/// Score one response against a key: `max(|r ∩ k| - |r \ k|, 0)`.
pub fn score(response: &ResponseValue, key: &ResponseValue) -> i32 {
    let credit = response.overlap(key) as i32;
    let penalty = response.excess(key) as i32;
    (credit - penalty).max(0)
}

/// Score a possibly-missing response; missing stays missing.
pub fn score_optional(response: Option<&ResponseValue>, key: &ResponseValue) -> Option<i32> {
    response.map(|r| score(r, key))
}

/// Person × item scores with [`MISSING`] for absent responses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreMatrix {
    item_ids: Vec<String>,
    max_scores: Vec<i32>,
    scores: Array2<i32>,
}

impl ScoreMatrix {
    /// Score every cell of `responses` against the keys in `bank`.
    pub fn from_responses(bank: &ItemBank, responses: &ResponseData) -> Self {
        let n_persons = responses.n_persons();
        let n_items = bank.len();

        let rows: Vec<Vec<i32>> = (0..n_persons)
            .into_par_iter()
            .map(|i| {
                bank.items()
                    .iter()
                    .enumerate()
                    .map(|(j, item)| {
                        score_optional(responses.response(i, j), &item.key).unwrap_or(MISSING)
                    })
                    .collect()
            })
            .collect();

        let mut scores = Array2::from_elem((n_persons, n_items), MISSING);
        for (i, row) in rows.iter().enumerate() {
            for (j, &val) in row.iter().enumerate() {
                scores[[i, j]] = val;
            }
        }

        Self {
            item_ids: bank.items().iter().map(|item| item.id.clone()).collect(),
            max_scores: bank.max_scores(),
            scores,
        }
    }

    /// Wrap a pre-computed matrix. `item_ids` and `max_scores` follow column order.
    pub fn from_parts(item_ids: Vec<String>, max_scores: Vec<i32>, scores: Array2<i32>) -> Self {
        Self {
            item_ids,
            max_scores,
            scores,
        }
    }

    pub fn n_persons(&self) -> usize {
        self.scores.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.scores.ncols()
    }

    pub fn item_ids(&self) -> &[String] {
        &self.item_ids
    }

    pub fn max_scores(&self) -> &[i32] {
        &self.max_scores
    }

    pub fn view(&self) -> &Array2<i32> {
        &self.scores
    }

    pub fn get(&self, person: usize, item: usize) -> Option<i32> {
        self.scores
            .get([person, item])
            .copied()
            .filter(|&s| s != MISSING)
    }

    pub fn column(&self, item: usize) -> ArrayView1<'_, i32> {
        self.scores.column(item)
    }

    /// Number of non-missing scores for a person.
    pub fn answered_count(&self, person: usize) -> usize {
        self.scores
            .row(person)
            .iter()
            .filter(|&&s| s != MISSING)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Item;

    fn v(s: &str) -> ResponseValue {
        ResponseValue::parse(s)
    }

    #[test]
    fn dichotomous_exact_match() {
        assert_eq!(score(&v("a"), &v("a")), 1);
        assert_eq!(score(&v("b"), &v("a")), 0);
    }

    #[test]
    fn polytomous_partial_credit_with_penalty() {
        let key = v("abc");
        assert_eq!(score(&v("abc"), &key), 3);
        assert_eq!(score(&v("ab"), &key), 2);
        assert_eq!(score(&v("abd"), &key), 1);
        assert_eq!(score(&v("ad"), &key), 0);
        assert_eq!(score(&v("de"), &key), 0);
    }

    #[test]
    fn empty_response_scores_zero() {
        assert_eq!(score(&v(""), &v("ab")), 0);
    }

    #[test]
    fn missing_response_has_no_score() {
        assert_eq!(score_optional(None, &v("a")), None);
    }

    #[test]
    fn score_bounded_by_key_size_for_all_subsets() {
        let alphabet: Vec<char> = "abcde".chars().collect();
        let key = v("bd");
        for mask in 0u32..(1 << alphabet.len()) {
            let resp = ResponseValue::from_symbols(
                alphabet
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, &c)| c),
            );
            let s = score(&resp, &key);
            assert!((0..=2).contains(&s), "response {resp} scored {s}");
        }
    }

    #[test]
    fn matrix_marks_missing_cells() {
        let bank = ItemBank::new(vec![
            Item::dichotomous("q1", "a", "abc").unwrap(),
            Item::polytomous("q2", "bc", "abc").unwrap(),
        ])
        .unwrap();
        let data = ResponseData::from_rows(
            &bank,
            &[vec![Some("a"), Some("bc")], vec![None, Some("ab")]],
        )
        .unwrap();
        let m = ScoreMatrix::from_responses(&bank, &data);
        assert_eq!(m.max_scores(), &[1, 2]);
        assert_eq!(m.get(0, 0), Some(1));
        assert_eq!(m.get(0, 1), Some(2));
        assert_eq!(m.get(1, 0), None);
        assert_eq!(m.get(1, 1), Some(0));
        assert_eq!(m.view()[[1, 0]], MISSING);
        assert_eq!(m.answered_count(1), 1);
    }
}

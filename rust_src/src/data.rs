//! Input data model: items, their keys, and the person × item response grid.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{ItemAnalysisError, MalformedResponseError, Result};

/// A set of selected symbols, kept sorted.
///
/// Dichotomous responses hold one symbol, polytomous responses one or more.
/// An empty set is a valid (blank) response, distinct from a missing one.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ResponseValue(BTreeSet<char>);

impl ResponseValue {
    /// Parse symbols from text; whitespace and `,` `;` `|` are separators.
    pub fn parse(text: &str) -> Self {
        Self(
            text.chars()
                .filter(|c| !c.is_whitespace() && !matches!(c, ',' | ';' | '|'))
                .collect(),
        )
    }

    pub fn from_symbols(symbols: impl IntoIterator<Item = char>) -> Self {
        Self(symbols.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `|self ∩ other|`
    pub fn overlap(&self, other: &Self) -> usize {
        self.0.intersection(&other.0).count()
    }

    /// `|self \ other|`
    pub fn excess(&self, other: &Self) -> usize {
        self.0.difference(&other.0).count()
    }

    /// First symbol of `self` that `alphabet` does not contain.
    pub fn first_outside(&self, alphabet: &Self) -> Option<char> {
        self.0.difference(&alphabet.0).next().copied()
    }
}

impl fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.0 {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl From<String> for ResponseValue {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for ResponseValue {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<ResponseValue> for String {
    fn from(value: ResponseValue) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Dichotomous,
    Polytomous,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::Dichotomous => f.write_str("dichotomous"),
            ItemType::Polytomous => f.write_str("polytomous"),
        }
    }
}

/// Item metadata: identity, type, answer key and the symbols a response may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub item_type: ItemType,
    pub key: ResponseValue,
    pub alphabet: ResponseValue,
}

impl Item {
    pub fn new(
        id: impl Into<String>,
        item_type: ItemType,
        key: &str,
        alphabet: &str,
    ) -> Result<Self> {
        let item = Self {
            id: id.into(),
            item_type,
            key: ResponseValue::parse(key),
            alphabet: ResponseValue::parse(alphabet),
        };
        item.validate()?;
        Ok(item)
    }

    pub fn dichotomous(id: impl Into<String>, key: &str, alphabet: &str) -> Result<Self> {
        Self::new(id, ItemType::Dichotomous, key, alphabet)
    }

    pub fn polytomous(id: impl Into<String>, key: &str, alphabet: &str) -> Result<Self> {
        Self::new(id, ItemType::Polytomous, key, alphabet)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ItemAnalysisError::invalid_item("", "item id is empty"));
        }
        if self.key.is_empty() {
            return Err(ItemAnalysisError::invalid_item(&self.id, "key is empty"));
        }
        if self.item_type == ItemType::Dichotomous && self.key.len() != 1 {
            return Err(ItemAnalysisError::invalid_item(
                &self.id,
                format!("dichotomous key must be one symbol, got '{}'", self.key),
            ));
        }
        if let Some(symbol) = self.key.first_outside(&self.alphabet) {
            return Err(ItemAnalysisError::invalid_item(
                &self.id,
                format!("key symbol '{symbol}' is not in alphabet '{}'", self.alphabet),
            ));
        }
        Ok(())
    }

    /// Highest achievable score: every key symbol and nothing else.
    pub fn max_score(&self) -> i32 {
        self.key.len() as i32
    }
}

/// Ordered collection of items with id lookup.
#[derive(Debug, Clone, Default)]
pub struct ItemBank {
    items: Vec<Item>,
    index: HashMap<String, usize>,
}

impl ItemBank {
    pub fn new(items: Vec<Item>) -> Result<Self> {
        let mut index = HashMap::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            item.validate()?;
            if index.insert(item.id.clone(), idx).is_some() {
                return Err(ItemAnalysisError::DuplicateItem(item.id.clone()));
            }
        }
        Ok(Self { items, index })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn max_scores(&self) -> Vec<i32> {
        self.items.iter().map(Item::max_score).collect()
    }
}

/// One long-format response record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub person: String,
    pub item: String,
    /// `None` marks a missing response.
    pub value: Option<String>,
}

/// Person × item grid of raw responses, validated against an item bank.
///
/// Persons are identified by their row index; `labels` keeps the caller's ids.
#[derive(Debug, Clone)]
pub struct ResponseData {
    labels: Vec<String>,
    cells: Array2<Option<ResponseValue>>,
}

impl ResponseData {
    /// Build from wide rows, one entry per bank item in bank order.
    pub fn from_rows<S: AsRef<str>>(bank: &ItemBank, rows: &[Vec<Option<S>>]) -> Result<Self> {
        let mut cells = Array2::from_elem((rows.len(), bank.len()), None);
        for (person, row) in rows.iter().enumerate() {
            if row.len() != bank.len() {
                return Err(ItemAnalysisError::InvalidInput(format!(
                    "row {person} has {} responses, expected {}",
                    row.len(),
                    bank.len()
                )));
            }
            for (j, raw) in row.iter().enumerate() {
                if let Some(raw) = raw {
                    cells[[person, j]] = Some(parse_checked(bank, person, j, raw.as_ref())?);
                }
            }
        }
        let labels = (0..rows.len()).map(|i| i.to_string()).collect();
        Ok(Self { labels, cells })
    }

    /// Build from long-format records. Persons are ordered by first appearance;
    /// cells with no record are missing.
    pub fn from_records(
        bank: &ItemBank,
        records: impl IntoIterator<Item = ResponseRecord>,
    ) -> Result<Self> {
        let mut labels: Vec<String> = Vec::new();
        let mut person_idx: HashMap<String, usize> = HashMap::new();
        let mut entries: Vec<(usize, usize, Option<String>)> = Vec::new();

        for record in records {
            let item = bank
                .index_of(&record.item)
                .ok_or_else(|| ItemAnalysisError::UnknownItem(record.item.clone()))?;
            let person = *person_idx.entry(record.person.clone()).or_insert_with(|| {
                labels.push(record.person.clone());
                labels.len() - 1
            });
            entries.push((person, item, record.value));
        }

        let mut seen = Array2::from_elem((labels.len(), bank.len()), false);
        let mut cells = Array2::from_elem((labels.len(), bank.len()), None);
        for (person, item, value) in entries {
            if seen[[person, item]] {
                return Err(ItemAnalysisError::InvalidInput(format!(
                    "duplicate response for person '{}' on item '{}'",
                    labels[person],
                    bank.items()[item].id
                )));
            }
            seen[[person, item]] = true;
            if let Some(raw) = value {
                cells[[person, item]] = Some(parse_checked(bank, person, item, &raw)?);
            }
        }
        Ok(Self { labels, cells })
    }

    pub fn n_persons(&self) -> usize {
        self.cells.nrows()
    }

    pub fn n_items(&self) -> usize {
        self.cells.ncols()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn response(&self, person: usize, item: usize) -> Option<&ResponseValue> {
        self.cells.get([person, item]).and_then(Option::as_ref)
    }
}

fn parse_checked(bank: &ItemBank, person: usize, item: usize, raw: &str) -> Result<ResponseValue> {
    let meta = &bank.items()[item];
    let value = ResponseValue::parse(raw);
    if let Some(symbol) = value.first_outside(&meta.alphabet) {
        return Err(MalformedResponseError {
            person,
            item: meta.id.clone(),
            symbol,
        }
        .into());
    }
    Ok(value)
}

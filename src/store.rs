use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::AnalysisResult;
use crate::util::parse_timestamp;
use crate::window::months_between;

#[derive(Debug, Clone)]
struct Entry {
  result: AnalysisResult,
  at: Option<DateTime<Utc>>,
}

/// Deduplicating accumulator of per-file analysis results.
///
/// Keyed by `(sha, filename)`; keeps insertion order. `min_timestamp`, `max_timestamp`
/// and `total_months` always reflect the current contents. Results whose timestamp does
/// not parse are kept but never count towards the extremes.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
  entries: Vec<Entry>,
  index: HashMap<(String, String), usize>,
  min: Option<DateTime<Utc>>,
  max: Option<DateTime<Utc>>,
}

impl ResultStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_results<I>(results: I) -> Self
  where
    I: IntoIterator<Item = AnalysisResult>,
  {
    let mut store = Self::new();
    store.replace_all(results);
    store
  }

  /// Inserts `result` unless its key is already present. Returns whether it was inserted.
  pub fn append(&mut self, result: AnalysisResult) -> bool {
    let key = (result.sha().to_string(), result.filename().to_string());

    if self.index.contains_key(&key) {
      return false;
    }

    let at = parse_timestamp(result.timestamp());
    self.index.insert(key, self.entries.len());
    self.entries.push(Entry { result, at });

    if let Some(t) = at {
      if self.min.map_or(true, |m| t < m) {
        self.min = Some(t);
      }
      if self.max.map_or(true, |m| t > m) {
        self.max = Some(t);
      }
    }

    true
  }

  /// Replaces the contents with an authoritative snapshot.
  ///
  /// Duplicate keys collapse to one entry: the last value wins, at the position where
  /// the key first appeared.
  pub fn replace_all<I>(&mut self, results: I)
  where
    I: IntoIterator<Item = AnalysisResult>,
  {
    self.clear();

    for result in results {
      let key = (result.sha().to_string(), result.filename().to_string());
      let at = parse_timestamp(result.timestamp());

      match self.index.get(&key).copied() {
        Some(idx) => self.entries[idx] = Entry { result, at },
        None => {
          self.index.insert(key, self.entries.len());
          self.entries.push(Entry { result, at });
        }
      }
    }

    self.recompute_extremes();
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.index.clear();
    self.min = None;
    self.max = None;
  }

  fn recompute_extremes(&mut self) {
    self.min = self.entries.iter().filter_map(|e| e.at).min();
    self.max = self.entries.iter().filter_map(|e| e.at).max();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn contains(&self, sha: &str, filename: &str) -> bool {
    self.index.contains_key(&(sha.to_string(), filename.to_string()))
  }

  pub fn iter(&self) -> impl Iterator<Item = &AnalysisResult> {
    self.entries.iter().map(|e| &e.result)
  }

  /// Results paired with their parsed instant, in insertion order.
  pub fn iter_timed(&self) -> impl Iterator<Item = (&AnalysisResult, Option<DateTime<Utc>>)> {
    self.entries.iter().map(|e| (&e.result, e.at))
  }

  pub fn min_timestamp(&self) -> Option<DateTime<Utc>> {
    self.min
  }

  pub fn max_timestamp(&self) -> Option<DateTime<Utc>> {
    self.max
  }

  /// Calendar months spanned by the results, inclusive. 0 when empty, otherwise at least 1.
  pub fn total_months(&self) -> u32 {
    if self.entries.is_empty() {
      return 0;
    }

    match (self.min, self.max) {
      (Some(min), Some(max)) => (months_between(min, max).max(0) as u32) + 1,
      _ => 1,
    }
  }
}

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::model::AnalysisResult;
use crate::store::ResultStore;
use crate::util::iso_utc;

// Month-bucket windowing over ResultStore contents. Buckets are UTC calendar months.

/// Whole calendar months from `start`'s month to `end`'s month (negative if `end` is earlier).
pub fn months_between(start: DateTime<Utc>, end: DateTime<Utc>) -> i32 {
  (end.year() - start.year()) * 12 + (end.month() as i32 - start.month() as i32)
}

/// First instant of the month lying `n` calendar months before `dt`'s month.
pub fn month_start_back(dt: DateTime<Utc>, n: u32) -> Option<DateTime<Utc>> {
  let total = (dt.year() * 12 + dt.month0() as i32) - n as i32;
  let y = total.div_euclid(12);
  let m = total.rem_euclid(12) as u32 + 1;

  NaiveDate::from_ymd_opt(y, m, 1)
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|ndt| ndt.and_utc())
}

/// Clamp a requested window width into `[1, total_months]`.
pub fn clamp_months(selected: u32, total_months: u32) -> u32 {
  selected.clamp(1, total_months.max(1))
}

/// A window of `selected_months` whole months ending at the newest result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
  pub selected_months: u32,
  pub total_months: u32,
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

impl TimeWindow {
  /// Window for `store`, with `selected_months` clamped. None when nothing is dated.
  pub fn for_store(store: &ResultStore, selected_months: u32) -> Option<TimeWindow> {
    let end = store.max_timestamp()?;
    let total_months = store.total_months();
    let selected_months = clamp_months(selected_months, total_months);
    let start = month_start_back(end, selected_months - 1)?;

    Some(TimeWindow {
      selected_months,
      total_months,
      start,
      end,
    })
  }

  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    self.start <= at && at <= self.end
  }

  pub fn info(&self) -> WindowInfo {
    WindowInfo {
      selected_months: self.selected_months,
      total_months: self.total_months,
      start: iso_utc(self.start),
      end: iso_utc(self.end),
    }
  }
}

/// Serializable window bounds for reports.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WindowInfo {
  pub selected_months: u32,
  pub total_months: u32,
  pub start: String,
  pub end: String,
}

/// Results of `store` falling inside the `selected_months` window, in insertion order.
///
/// Both bounds are inclusive; undated results never match. Empty store, empty output.
pub fn filter(store: &ResultStore, selected_months: u32) -> Vec<AnalysisResult> {
  let Some(window) = TimeWindow::for_store(store, selected_months) else {
    return Vec::new();
  };

  store
    .iter_timed()
    .filter(|(_, at)| at.map(|t| window.contains(t)).unwrap_or(false))
    .map(|(r, _)| r.clone())
    .collect()
}

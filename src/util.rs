// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Utilities for timestamp parsing/formatting and man page rendering
// role: utilities/helpers
// inputs: ISO-ish timestamp strings from the backend; clap CommandFactory
// outputs: UTC instants, RFC3339 strings, man page text
// invariants:
// - parse_timestamp never panics; unparseable input yields None
// - naive timestamps (no offset) are read as UTC
// errors: render_man_page surfaces IO errors from clap_mangen
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use clap::CommandFactory;

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Parse a backend timestamp into a UTC instant.
///
/// Accepts RFC3339 (with offset), RFC2822, naive date-times (read as UTC) and bare dates
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
  let s = raw.trim();

  if s.is_empty() {
    return None;
  }

  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc));
  }

  if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
    return Some(dt.with_timezone(&Utc));
  }

  for fmt in NAIVE_FORMATS {
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
      return Some(ndt.and_utc());
    }
  }

  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|ndt| ndt.and_utc())
}

pub fn iso_utc(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render a section-1 man page for a clap `CommandFactory` implementor.
/// Returns the troff content as a UTF-8 string.
pub fn render_man_page<T: CommandFactory>() -> anyhow::Result<String> {
  let cmd = T::command();
  let man = clap_mangen::Man::new(cmd);
  let mut buf: Vec<u8> = Vec::new();

  man.render(&mut buf)?;

  Ok(String::from_utf8_lossy(&buf).to_string())
}

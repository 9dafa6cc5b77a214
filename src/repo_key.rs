use serde::{Deserialize, Serialize};
use std::fmt;

/// Short repository identifier shared by the UI, transport events and status queries.
///
/// Derived from the repository URL: trailing slashes and a `.git` suffix are dropped and
/// the last path segment is kept. `https://github.com/acme/widgets.git` becomes `widgets`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoKey(String);

impl RepoKey {
  pub fn from_url(url: &str) -> Self {
    let trimmed = url.trim().trim_end_matches('/');
    let cleaned = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let last = cleaned.rsplit(&['/', ':'][..]).next().unwrap_or(cleaned);

    RepoKey(last.to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// True when `url` names the same repository as this key.
  pub fn matches_url(&self, url: &str) -> bool {
    RepoKey::from_url(url) == *self
  }
}

impl fmt::Display for RepoKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

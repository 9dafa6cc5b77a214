// === Module Header (agents-tooling) START ===
// header: Parsed by scripts/check_module_headers.sh for purpose/role presence; keep keys on single-line entries.
// purpose: Group flat per-file change rows (POST /commits) into per-commit records
// role: commit construction
// inputs: FileChangeEvent rows, already one row per file per commit
// outputs: Commit structs in first-seen sha order
// invariants:
// - output order follows the first occurrence of each sha
// - file_changes keep input order; author/timestamp come from the first row of the sha
// - no deduplication of (sha, filename); callers guarantee uniqueness
// errors: None; rows without a sha are rejected before reaching this module
// tie_breakers: contracts > orchestration > correctness > performance > minimal_diffs
// === Module Header END ===

use std::collections::HashMap;

use crate::model::{Commit, FileChangeEvent};

/// Groups file change rows by commit sha.
pub fn group(events: &[FileChangeEvent]) -> Vec<Commit> {
  let mut commits: Vec<Commit> = Vec::new();
  let mut by_sha: HashMap<&str, usize> = HashMap::new();

  for event in events {
    let idx = *by_sha.entry(event.sha.as_str()).or_insert_with(|| {
      commits.push(Commit {
        sha: event.sha.clone(),
        author: event.author.clone(),
        timestamp: event.timestamp.clone(),
        file_changes: Vec::new(),
      });
      commits.len() - 1
    });

    commits[idx].file_changes.push(event.clone());
  }

  commits
}

/// Inverse of [`group`]: commit order, then file order.
pub fn flatten(commits: &[Commit]) -> Vec<FileChangeEvent> {
  commits.iter().flat_map(|c| c.file_changes.iter().cloned()).collect()
}

pub fn total_files(commits: &[Commit]) -> usize {
  commits.iter().map(|c| c.file_changes.len()).sum()
}

//! Working-tree and history inspection for progress detection
//!
//! The runner never mutates the repository; it only observes it. Changed
//! file counts feed the response analyzer and the circuit breaker, commit
//! counts feed the evidence collector.

use chrono::{DateTime, Utc};
use git2::{Delta, DiffOptions, Repository};
use std::collections::HashSet;
use std::path::Path;

/// Read-only inspector over a git repository
pub struct GitInspector {
    repo: Repository,
}

impl GitInspector {
    /// Open the repository containing `path`.
    ///
    /// Fails when the path is not inside a version-controlled tree; callers
    /// treat that as "git facts unavailable" rather than an error.
    pub fn open(path: &Path) -> Result<Self, String> {
        let repo = Repository::discover(path)
            .map_err(|e| format!("Failed to open git repository at {:?}: {}", path, e))?;
        Ok(Self { repo })
    }

    /// Count distinct changed paths in the working tree.
    ///
    /// Primary measure is the diff against HEAD (staged + unstaged
    /// combined). When HEAD is unavailable (unborn branch) the unstaged
    /// diff is used, then the staged diff. Untracked files are not counted.
    pub fn changed_file_count(&self) -> Result<usize, String> {
        let mut opts = DiffOptions::new();

        let diff = match self.repo.head().and_then(|h| h.peel_to_tree()) {
            Ok(head_tree) => self
                .repo
                .diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))
                .map_err(|e| format!("Failed to diff against HEAD: {}", e))?,
            Err(_) => match self.repo.diff_index_to_workdir(None, Some(&mut opts)) {
                Ok(diff) => diff,
                Err(_) => self
                    .repo
                    .diff_tree_to_index(None, None, Some(&mut opts))
                    .map_err(|e| format!("Failed to diff index: {}", e))?,
            },
        };

        let mut paths: HashSet<String> = HashSet::new();
        for delta in diff.deltas() {
            if delta.status() == Delta::Untracked {
                continue;
            }
            if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                paths.insert(path.to_string_lossy().to_string());
            }
        }

        Ok(paths.len())
    }

    /// Count commits whose commit time is at or after `since`
    pub fn commit_count_since(&self, since: &DateTime<Utc>) -> Result<usize, String> {
        let mut revwalk = self
            .repo
            .revwalk()
            .map_err(|e| format!("Failed to walk history: {}", e))?;

        if revwalk.push_head().is_err() {
            // Unborn branch: no commits yet
            return Ok(0);
        }

        let cutoff = since.timestamp();
        let mut count = 0;

        for oid in revwalk {
            let oid = oid.map_err(|e| format!("Failed to read commit id: {}", e))?;
            let commit = self
                .repo
                .find_commit(oid)
                .map_err(|e| format!("Failed to read commit {}: {}", oid, e))?;

            if commit.time().seconds() >= cutoff {
                count += 1;
            } else {
                // History is walked newest-first; older commits follow
                break;
            }
        }

        Ok(count)
    }

    /// Whether the current branch has been pushed to its upstream.
    ///
    /// `None` when there is no branch or no upstream configured.
    pub fn branch_pushed(&self) -> Option<bool> {
        let head = self.repo.head().ok()?;
        if !head.is_branch() {
            return None;
        }

        let branch = git2::Branch::wrap(head);
        let upstream = branch.upstream().ok()?;

        let local_oid = branch.get().target()?;
        let upstream_oid = upstream.get().target()?;

        let (ahead, _behind) = self.repo.graph_ahead_behind(local_oid, upstream_oid).ok()?;
        Some(ahead == 0)
    }
}

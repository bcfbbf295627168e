//! Local retention.
//!
//! Two independent passes keep the store bounded:
//!
//! * full-param pruning drops the `params` blob of DELTA commits outside the
//!   newest `full_params_window` commits. Checkpoints always keep theirs and
//!   the deltas stay, so every commit remains reconstructable.
//! * horizon pruning deletes whole commit directories beyond the newest
//!   `commit_horizon` commits, but only commits already confirmed pushed. A
//!   retained DELTA commit whose parent is about to go is first re-anchored:
//!   its full params are materialized and it becomes a local checkpoint.

use std::collections::HashSet;
use std::fs;

use tracing::{debug, info};

use crate::error::{FilesystemError, RepoError};
use crate::repo::commit::{Commit, CommitHash, CommitKind, CommitType};
use crate::repo::store::CommitStore;
use crate::tensor;

impl CommitStore {
    /// Removes full params of DELTA commits older than the newest `window`
    /// commits. Returns the commits that lost their params blob.
    pub fn prune_full_params(&mut self, window: usize) -> Result<Vec<CommitHash>, RepoError> {
        self.with_lock(|store| store.prune_full_params_locked(window))
    }

    pub(crate) fn prune_full_params_locked(
        &mut self,
        window: usize,
    ) -> Result<Vec<CommitHash>, RepoError> {
        let candidates: Vec<CommitHash> = self.hashes().iter().rev().skip(window).cloned().collect();
        let mut pruned = Vec::new();
        for hash in candidates {
            if self.get(&hash)?.commit_type() != Some(CommitType::Delta) {
                continue;
            }
            let path = self.params_path(&hash);
            if path.is_file() {
                fs::remove_file(&path).map_err(FilesystemError::io(&path))?;
                debug!(commit = %hash, "pruned full params");
                pruned.push(hash);
            }
        }
        Ok(pruned)
    }

    /// Deletes pushed commits older than the newest `horizon` commits.
    /// Returns the deleted commits, oldest first.
    pub fn prune_horizon(&mut self, horizon: usize) -> Result<Vec<CommitHash>, RepoError> {
        self.with_lock(|store| store.prune_horizon_locked(horizon))
    }

    pub(crate) fn prune_horizon_locked(
        &mut self,
        horizon: usize,
    ) -> Result<Vec<CommitHash>, RepoError> {
        let total = self.len();
        if total <= horizon {
            return Ok(Vec::new());
        }
        let cut = total - horizon;
        let mut doomed = Vec::new();
        for hash in &self.hashes()[..cut] {
            if self.get(hash)?.is_pushed() {
                doomed.push(hash.clone());
            }
        }
        if doomed.is_empty() {
            return Ok(doomed);
        }
        let doomed_set: HashSet<&CommitHash> = doomed.iter().collect();

        let retained: Vec<CommitHash> = self
            .hashes()
            .iter()
            .filter(|h| !doomed_set.contains(h))
            .cloned()
            .collect();
        for hash in &retained {
            let commit = self.get(hash)?;
            let needs_anchor = matches!(
                commit.finalized(),
                Some(c) if matches!(c.kind, CommitKind::Delta(_))
                    && c.parent.commit().is_some_and(|p| doomed_set.contains(p))
            );
            if needs_anchor {
                self.reanchor(commit)?;
            }
        }

        for hash in &doomed {
            self.remove_locked(hash)?;
        }
        info!(removed = doomed.len(), horizon, "pruned commits beyond horizon");
        Ok(doomed)
    }

    /// Turns a DELTA commit into a local checkpoint holding its full params.
    fn reanchor(&mut self, commit: Commit) -> Result<(), RepoError> {
        let hash = commit.hash().clone();
        let full = self.full_params(&hash)?;
        let path = self.params_path(&hash);
        tensor::save(&path, &full)?;
        let params_hash = tensor::file_hash(&path).map_err(FilesystemError::io(&path))?;

        let anchored = match commit {
            Commit::Draft(_) => return Ok(()),
            Commit::Finalized(mut c) => {
                c.params.hash = params_hash;
                c.kind = CommitKind::Checkpoint;
                Commit::Finalized(c)
            }
            Commit::Pushed {
                commit: mut c,
                remote_hash,
            } => {
                c.params.hash = params_hash;
                c.kind = CommitKind::Checkpoint;
                Commit::Pushed {
                    commit: c,
                    remote_hash,
                }
            }
        };
        self.save(&anchored)?;
        let delta = self.delta_path(&hash);
        if delta.is_file() {
            fs::remove_file(&delta).map_err(FilesystemError::io(&delta))?;
        }
        debug!(commit = %hash, "re-anchored as checkpoint");
        Ok(())
    }
}

//! Rebuilding full tensor maps from checkpoint + delta history.

use tracing::debug;

use crate::delta;
use crate::error::{ReconstructionError, RepoError};
use crate::repo::commit::{Commit, CommitHash, CommitKind, FinalizedCommit};
use crate::repo::store::CommitStore;
use crate::tensor::{self, TensorMap};

impl CommitStore {
    /// Walks back from `target` to its nearest checkpoint.
    ///
    /// Returns the commits from the checkpoint (first) to `target` (last). The
    /// walk is bounded by the number of commits in the store, so a cycle in
    /// the parent links is reported instead of looping.
    pub fn chain_to_checkpoint(
        &self,
        target: &CommitHash,
    ) -> Result<Vec<FinalizedCommit>, RepoError> {
        if !self.contains(target) {
            return Err(ReconstructionError::UnknownCommit(target.clone()).into());
        }
        let limit = self.len();
        let mut stack: Vec<FinalizedCommit> = Vec::new();
        let mut cursor = target.clone();
        loop {
            if stack.len() >= limit {
                return Err(ReconstructionError::Cycle {
                    commit: target.clone(),
                    steps: stack.len(),
                }
                .into());
            }
            let commit = match self.get(&cursor)? {
                Commit::Draft(draft) => {
                    return Err(ReconstructionError::NotFinalized(draft.hash).into())
                }
                Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => c,
            };
            let is_checkpoint = matches!(commit.kind, CommitKind::Checkpoint);
            let parent = commit.parent.commit().cloned();
            stack.push(commit);
            if is_checkpoint {
                break;
            }
            match parent {
                None => return Err(ReconstructionError::NoCheckpoint(target.clone()).into()),
                Some(parent) if !self.contains(&parent) => {
                    return Err(ReconstructionError::BrokenChain {
                        commit: cursor,
                        parent,
                    }
                    .into())
                }
                Some(parent) => cursor = parent,
            }
        }
        stack.reverse();
        Ok(stack)
    }

    /// Full tensor map of `target`, replayed from its nearest checkpoint.
    pub fn reconstruct(&self, target: &CommitHash) -> Result<TensorMap, RepoError> {
        let chain = self.chain_to_checkpoint(target)?;
        let mut chain = chain.into_iter();
        let checkpoint = chain
            .next()
            .ok_or_else(|| ReconstructionError::UnknownCommit(target.clone()))?;

        let path = self.params_path(&checkpoint.hash);
        if !path.is_file() {
            return Err(ReconstructionError::MissingCheckpoint(checkpoint.hash).into());
        }
        let mut mapping = tensor::load(&path)?;
        debug!(checkpoint = %checkpoint.hash, target = %target, "replaying deltas");

        for commit in chain {
            let path = self.delta_path(&commit.hash);
            if !path.is_file() {
                return Err(ReconstructionError::MissingDelta(commit.hash).into());
            }
            let step = delta::load_delta(&path).map_err(|source| ReconstructionError::Replay {
                commit: commit.hash.clone(),
                source,
            })?;
            delta::apply_delta(&mut mapping, &step).map_err(|source| {
                ReconstructionError::Replay {
                    commit: commit.hash.clone(),
                    source,
                }
            })?;
        }
        Ok(mapping)
    }

    /// The full params of `hash`: read directly when still on disk,
    /// reconstructed otherwise.
    pub fn full_params(&self, hash: &CommitHash) -> Result<TensorMap, RepoError> {
        let path = self.params_path(hash);
        if path.is_file() {
            return Ok(tensor::load(&path)?);
        }
        debug!(commit = %hash, "full params pruned, reconstructing");
        self.reconstruct(hash)
    }
}

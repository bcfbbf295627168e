//! Error taxonomy shared by the repository layer.
//!
//! Each failure class gets its own type so callers can tell local
//! inconsistencies (draft state, reconstruction) from remote and filesystem
//! trouble. [`RepoError`] is the umbrella returned by [`crate::repo::Repository`].

use std::io;
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::delta::DeltaError;
use crate::proof::ProofError;
use crate::remote::{PushStep, RemoteError};
use crate::repo::commit::CommitHash;
use crate::tensor::TensorError;

/// An operation was attempted out of sequence in the draft lifecycle.
#[derive(Debug, Error)]
pub enum DraftStateError {
    #[error("commit {0} is not finalized yet; finish it before adding another")]
    OutstandingDraft(CommitHash),
    #[error("there is no draft commit; run `add` first")]
    NoDraft,
    #[error("params are already attached to commit {0}")]
    ParamsAlreadyAttached(CommitHash),
    #[error("commit {0} has no params attached")]
    MissingParams(CommitHash),
    #[error("commit {0} has no proof attached")]
    MissingProof(CommitHash),
    #[error("commit {0} is already finalized")]
    AlreadyFinalized(CommitHash),
    #[error("a commit message is required")]
    EmptyMessage,
}

/// A commit's full tensor map could not be rebuilt from local history.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("commit {0} is not in the local store")]
    UnknownCommit(CommitHash),
    #[error("commit {commit} points at parent {parent} which is not in the local store")]
    BrokenChain {
        commit: CommitHash,
        parent: CommitHash,
    },
    #[error("history of commit {0} reaches genesis without a checkpoint")]
    NoCheckpoint(CommitHash),
    #[error("history of commit {commit} does not terminate after {steps} steps")]
    Cycle { commit: CommitHash, steps: usize },
    #[error("commit {0} is a draft and has no place in history yet")]
    NotFinalized(CommitHash),
    #[error("checkpoint params of commit {0} are missing")]
    MissingCheckpoint(CommitHash),
    #[error("delta params of commit {0} are missing")]
    MissingDelta(CommitHash),
    #[error("failed to replay commit {commit}: {source}")]
    Replay {
        commit: CommitHash,
        #[source]
        source: DeltaError,
    },
}

/// A push step was rejected or could not be carried out.
#[derive(Debug, Error)]
#[error("push step {step} failed for commit {commit}: {source}")]
pub struct RemoteProtocolError {
    pub step: PushStep,
    pub commit: CommitHash,
    #[source]
    pub source: RemoteError,
}

/// A content hash did not match the value echoed by the remote.
#[derive(Debug, Error)]
#[error("{artifact} hash mismatch: expected {expected}, found {actual}")]
pub struct IntegrityError {
    pub artifact: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("no .flair repository found at or above {0}")]
    NotARepository(PathBuf),
    #[error("a repository already exists at {0}")]
    AlreadyInitialized(PathBuf),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt local state in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

impl FilesystemError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> FilesystemError + '_ {
        move |source| FilesystemError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl ToString) -> FilesystemError {
        FilesystemError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    DraftState(#[from] DraftStateError),
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
    #[error(transparent)]
    RemoteProtocol(#[from] RemoteProtocolError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error("remote request failed: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("branch `{0}` does not exist on the remote")]
    BranchNotFound(String),
    #[error("cannot delete `{0}` while it is checked out")]
    BranchCheckedOut(String),
}

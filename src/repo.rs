//! Local repository state and the operations that drive it.
//!
//! A repository is a `.flair` directory next to the user's model files. It
//! mirrors a repository on the remote ledger and keeps everything needed to
//! work offline between pushes:
//!
//! ```text
//! .flair/
//!   repo.json        cached repository record
//!   HEAD             {currentBranch, branchHash, previousCommit}
//!   branches.json    cached branch list
//!   commits/         the commit store, see [`store`]
//!   worktree/        working artifacts of the checked out branch
//!   branch_cache/    per-branch snapshots of the worktree, see [`cache`]
//! ```
//!
//! The workflow mirrors Git's, with the staging split into explicit steps:
//!
//! ```rust,ignore
//! let mut repo = Repository::open(".", config)?;
//! repo.add()?;
//! repo.create_params(&SafetensorsExtractor, Path::new("model.safetensors"))?;
//! repo.create_proof(&prover, Path::new("model.onnx"), &[1, 3], "ezkl")?;
//! repo.commit("fine-tune on batch 7")?;
//! repo.push(&mut remote, None)?;
//! ```
//!
//! Nothing in here talks to the network directly. Operations that need the
//! ledger take a [`Remote`] so tests can run against
//! [`crate::remote::memory::MemoryRemote`].

pub mod cache;
pub mod commit;
pub mod gc;
pub mod push;
pub mod reconstruct;
pub mod store;

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{FilesystemError, RepoError};
use crate::extract::WeightExtractor;
use crate::proof::{ProofBundle, ProofService};
use crate::remote::{Branch, CreateBranch, Remote, RepositoryInfo};
use crate::tensor::TensorMap;

use cache::{BranchCache, WorkTree};
use commit::{Commit, CommitHash, CommitType, DraftCommit, ParamsRef, Parent, ZkpRef};
use store::CommitStore;

pub const FLAIR_DIR: &str = ".flair";
pub const REPO_FILE: &str = "repo.json";
pub const HEAD_FILE: &str = "HEAD";
pub const BRANCHES_FILE: &str = "branches.json";
pub const COMMITS_DIR: &str = "commits";
pub const WORKTREE_DIR: &str = "worktree";
pub const CACHE_DIR: &str = "branch_cache";

/// Name used when neither HEAD nor the remote names a branch.
pub const DEFAULT_BRANCH: &str = "main";

/// The working-copy pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub current_branch: String,
    #[serde(default)]
    pub branch_hash: Option<String>,
    pub previous_commit: Parent,
}

impl Default for Head {
    fn default() -> Self {
        Head {
            current_branch: DEFAULT_BRANCH.to_string(),
            branch_hash: None,
            previous_commit: Parent::Genesis,
        }
    }
}

/// Summary for `flair status`.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub head: Head,
    pub draft: Option<DraftCommit>,
    /// Finalized commits not yet pushed.
    pub unpushed: usize,
}

#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    dir: PathBuf,
    config: Config,
    store: CommitStore,
}

impl Repository {
    /// Creates `.flair` under `root` for the remote repository `info`.
    ///
    /// HEAD starts on the repository's default branch when `branches` names
    /// it, otherwise on `main`.
    pub fn init(
        root: &Path,
        info: &RepositoryInfo,
        branches: &[Branch],
        config: Config,
    ) -> Result<Self, RepoError> {
        let dir = root.join(FLAIR_DIR);
        if dir.join(REPO_FILE).is_file() {
            return Err(FilesystemError::AlreadyInitialized(dir).into());
        }
        fs::create_dir_all(&dir).map_err(FilesystemError::io(&dir))?;
        write_json(&dir.join(REPO_FILE), info)?;
        write_json(&dir.join(BRANCHES_FILE), &branches)?;

        let default = branches
            .iter()
            .find(|b| Some(&b.branch_hash) == info.default_branch_hash.as_ref())
            .or_else(|| branches.iter().find(|b| b.name == DEFAULT_BRANCH));
        let head = match default {
            Some(branch) => Head {
                current_branch: branch.name.clone(),
                branch_hash: Some(branch.branch_hash.clone()),
                previous_commit: Parent::Genesis,
            },
            None => Head::default(),
        };
        write_json(&dir.join(HEAD_FILE), &head)?;
        info!(repo = %info.hash, branch = %head.current_branch, "initialized repository");
        Self::open(root, config)
    }

    /// Fetches the repository record and branch list from `remote` and
    /// initializes `root` with them.
    pub fn init_from_remote<R: Remote + ?Sized>(
        root: &Path,
        remote: &mut R,
        config: Config,
    ) -> Result<Self, RepoError> {
        let info = remote.repository()?;
        let branches = remote.list_branches()?;
        Self::init(root, &info, &branches, config)
    }

    /// Opens the repository whose `.flair` directory is directly under `root`.
    pub fn open(root: &Path, config: Config) -> Result<Self, RepoError> {
        let dir = root.join(FLAIR_DIR);
        if !dir.join(REPO_FILE).is_file() {
            return Err(FilesystemError::NotARepository(root.to_path_buf()).into());
        }
        let store = CommitStore::open(dir.join(COMMITS_DIR), config.retention)?;
        debug!(root = %root.display(), commits = store.len(), "opened repository");
        Ok(Repository {
            root: root.to_path_buf(),
            dir,
            config,
            store,
        })
    }

    /// Opens the nearest repository at or above `start`.
    pub fn discover(start: &Path, config: Config) -> Result<Self, RepoError> {
        let found = start
            .ancestors()
            .find(|dir| dir.join(FLAIR_DIR).join(REPO_FILE).is_file());
        match found {
            Some(root) => Self::open(root, config),
            None => Err(FilesystemError::NotARepository(start.to_path_buf()).into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CommitStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CommitStore {
        &mut self.store
    }

    pub fn worktree(&self) -> WorkTree {
        WorkTree::new(self.dir.join(WORKTREE_DIR))
    }

    pub fn branch_cache(&self) -> BranchCache {
        BranchCache::new(self.dir.join(CACHE_DIR), self.config.cache.slots)
    }

    pub fn info(&self) -> Result<RepositoryInfo, RepoError> {
        Ok(read_json(&self.dir.join(REPO_FILE))?)
    }

    pub fn head(&self) -> Result<Head, RepoError> {
        Ok(read_json_opt(&self.dir.join(HEAD_FILE))?.unwrap_or_default())
    }

    pub fn set_head(&self, head: &Head) -> Result<(), RepoError> {
        write_json(&self.dir.join(HEAD_FILE), head)?;
        debug!(branch = %head.current_branch, previous = %head.previous_commit, "updated HEAD");
        Ok(())
    }

    /// Branch list as of the last refresh.
    pub fn cached_branches(&self) -> Result<Vec<Branch>, RepoError> {
        Ok(read_json_opt(&self.dir.join(BRANCHES_FILE))?.unwrap_or_default())
    }

    pub fn refresh_branches<R: Remote + ?Sized>(
        &self,
        remote: &mut R,
    ) -> Result<Vec<Branch>, RepoError> {
        let branches = remote.list_branches()?;
        write_json(&self.dir.join(BRANCHES_FILE), &branches)?;
        Ok(branches)
    }

    /// Starts a new draft commit on the checked out branch.
    pub fn add(&mut self) -> Result<CommitHash, RepoError> {
        let head = self.head()?;
        let architecture = self.config.default_framework.clone();
        self.store
            .create_draft(&architecture, &head.current_branch, &head.previous_commit)
    }

    /// Extracts the weights of `model` into the current draft.
    pub fn create_params<E: WeightExtractor + ?Sized>(
        &mut self,
        extractor: &E,
        model: &Path,
    ) -> Result<ParamsRef, RepoError> {
        let tensors = extractor.extract(model)?;
        self.store.attach_params(&tensors, extractor.framework())
    }

    pub fn attach_params(
        &mut self,
        tensors: &TensorMap,
        framework: &str,
    ) -> Result<ParamsRef, RepoError> {
        self.store.attach_params(tensors, framework)
    }

    /// Proves `model` and stores the proof on the current draft.
    pub fn create_proof<P: ProofService + ?Sized>(
        &mut self,
        prover: &P,
        model: &Path,
        input_dims: &[usize],
        backend: &str,
    ) -> Result<ZkpRef, RepoError> {
        // Fail before the slow proving round trip when there is nothing to attach to.
        if self.store.draft()?.is_none() {
            return Err(crate::error::DraftStateError::NoDraft.into());
        }
        let bundle = prover.prove(model, input_dims, backend)?;
        self.store.attach_proof(&bundle)
    }

    pub fn attach_proof(&mut self, bundle: &ProofBundle) -> Result<ZkpRef, RepoError> {
        self.store.attach_proof(bundle)
    }

    /// Finalizes the current draft and makes its artifacts the working tree.
    pub fn commit(&mut self, message: &str) -> Result<CommitType, RepoError> {
        let commit_type = self.store.finalize(message)?;
        let Some(latest) = self.store.latest()? else {
            return Ok(commit_type);
        };
        let hash = latest.hash();
        let worktree = self.worktree();
        worktree.clear()?;
        let params = self.store.params_path(hash);
        if params.is_file() {
            worktree.copy_params_from(&params)?;
        } else {
            worktree.write_params(&self.store.reconstruct(hash)?)?;
        }
        let [proof, vk, settings] = self.store.proof_paths(hash);
        worktree.copy_proof_from([&proof, &vk, &settings])?;
        Ok(commit_type)
    }

    /// Full tensor map of any local commit.
    pub fn reconstruct(&self, hash: &CommitHash) -> Result<TensorMap, RepoError> {
        self.store.reconstruct(hash)
    }

    /// Local history, oldest first.
    pub fn log(&self) -> Result<Vec<Commit>, RepoError> {
        Ok(self.store.commits()?)
    }

    pub fn status(&self) -> Result<Status, RepoError> {
        let commits = self.store.commits()?;
        let unpushed = commits
            .iter()
            .filter(|c| matches!(c, Commit::Finalized(_)))
            .count();
        Ok(Status {
            head: self.head()?,
            draft: self.store.draft()?,
            unpushed,
        })
    }

    /// Creates `name` on the remote, branching off the current branch.
    pub fn create_branch<R: Remote + ?Sized>(
        &self,
        remote: &mut R,
        name: &str,
    ) -> Result<Branch, RepoError> {
        let head = self.head()?;
        let branch = remote.create_branch(&CreateBranch {
            name: name.to_string(),
            current_branch_hash: head.branch_hash,
            description: None,
        })?;
        self.refresh_branches(remote)?;
        info!(branch = %branch.name, hash = %branch.branch_hash, "created branch");
        Ok(branch)
    }

    /// Deletes `name` on the remote and drops its cache slot.
    pub fn delete_branch<R: Remote + ?Sized>(
        &self,
        remote: &mut R,
        name: &str,
    ) -> Result<(), RepoError> {
        if self.head()?.current_branch == name {
            return Err(RepoError::BranchCheckedOut(name.to_string()));
        }
        let branch = remote
            .branch_by_name(name)?
            .ok_or_else(|| RepoError::BranchNotFound(name.to_string()))?;
        remote.delete_branch(&branch.branch_hash)?;
        self.branch_cache().remove(name)?;
        self.refresh_branches(remote)?;
        info!(branch = %name, "deleted branch");
        Ok(())
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, FilesystemError> {
    let bytes = fs::read(path).map_err(FilesystemError::io(path))?;
    serde_json::from_slice(&bytes).map_err(|e| FilesystemError::corrupt(path, e))
}

pub(crate) fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, FilesystemError> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| FilesystemError::corrupt(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FilesystemError::io(path)(e)),
    }
}

/// Writes `value` as pretty JSON through a temporary file and a rename.
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), FilesystemError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| FilesystemError::corrupt(path, e))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(FilesystemError::io(parent))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, bytes).map_err(FilesystemError::io(&tmp))?;
    fs::rename(&tmp, path).map_err(FilesystemError::io(path))
}

//! Working tree and per-branch artifact cache.
//!
//! The working tree holds the params and proof bundle of whatever branch is
//! checked out. Switching branches snapshots the current working tree into
//! that branch's cache slot and then fills the working tree for the target,
//! either from its slot or from the remote. Only the most recently used
//! `slots` branches keep a slot.
//!
//! Recency is tracked by a generation counter stored in each slot's
//! `slot.json`, bumped whenever the slot is written or restored, so the
//! eviction order never depends on filesystem timestamps.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FilesystemError, IntegrityError, RepoError};
use crate::proof::ProofBundle;
use crate::remote::Remote;
use crate::repo::commit::{Commit, CommitHash, Parent};
use crate::repo::{read_json_opt, write_json, Head, Repository};
use crate::tensor::{self, TensorError, TensorMap};

pub const PARAMS_FILE: &str = "params.safetensors";
pub const PROOF_FILES: [&str; 3] = [
    "zkp/proof.zlib",
    "zkp/verification_key.zlib",
    "zkp/settings.zlib",
];
pub const SLOT_FILE: &str = "slot.json";

fn artifact_names() -> impl Iterator<Item = &'static str> {
    std::iter::once(PARAMS_FILE).chain(PROOF_FILES)
}

fn copy_file(from: &Path, to: &Path) -> Result<(), FilesystemError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(FilesystemError::io(parent))?;
    }
    fs::copy(from, to).map_err(FilesystemError::io(from))?;
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), FilesystemError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(FilesystemError::io(parent))?;
    }
    fs::write(path, bytes).map_err(FilesystemError::io(path))
}

/// Copies every artifact present under `from` into `to`.
fn copy_artifacts(from: &Path, to: &Path) -> Result<usize, FilesystemError> {
    let mut copied = 0;
    for name in artifact_names() {
        let src = from.join(name);
        if src.is_file() {
            copy_file(&src, &to.join(name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// The mutable working artifacts of the checked out branch.
#[derive(Debug, Clone)]
pub struct WorkTree {
    root: PathBuf,
}

impl WorkTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkTree { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn params_path(&self) -> PathBuf {
        self.root.join(PARAMS_FILE)
    }

    pub fn proof_paths(&self) -> [PathBuf; 3] {
        PROOF_FILES.map(|name| self.root.join(name))
    }

    pub fn has_artifacts(&self) -> bool {
        artifact_names().any(|name| self.root.join(name).is_file())
    }

    pub fn clear(&self) -> Result<(), FilesystemError> {
        for name in artifact_names() {
            let path = self.root.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(FilesystemError::io(&path)(e)),
            }
        }
        Ok(())
    }

    pub fn params(&self) -> Result<TensorMap, TensorError> {
        tensor::load(&self.params_path())
    }

    pub fn write_params(&self, tensors: &TensorMap) -> Result<(), RepoError> {
        tensor::save(&self.params_path(), tensors)?;
        Ok(())
    }

    pub fn write_params_bytes(&self, bytes: &[u8]) -> Result<(), FilesystemError> {
        write_file(&self.params_path(), bytes)
    }

    pub fn copy_params_from(&self, path: &Path) -> Result<(), FilesystemError> {
        copy_file(path, &self.params_path())
    }

    pub fn write_proof(&self, bundle: &ProofBundle) -> Result<(), FilesystemError> {
        let [proof, vk, settings] = self.proof_paths();
        write_file(&proof, &bundle.proof)?;
        write_file(&vk, &bundle.verification_key)?;
        write_file(&settings, &bundle.settings)
    }

    /// Copies proof, verification key and settings files into the tree.
    pub fn copy_proof_from(&self, files: [&Path; 3]) -> Result<(), FilesystemError> {
        for (from, to) in files.iter().zip(self.proof_paths()) {
            copy_file(from, &to)?;
        }
        Ok(())
    }
}

/// Bookkeeping of one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSlot {
    pub branch: String,
    #[serde(default)]
    pub branch_hash: Option<String>,
    #[serde(default)]
    pub commit: Option<CommitHash>,
    pub generation: u64,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BranchCache {
    root: PathBuf,
    capacity: usize,
}

impl BranchCache {
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Self {
        BranchCache {
            root: root.into(),
            capacity,
        }
    }

    /// Slot directory of `branch`; names are hex encoded so any branch name
    /// maps to a single path component.
    pub fn slot_dir(&self, branch: &str) -> PathBuf {
        self.root.join(hex::encode(branch))
    }

    pub fn get(&self, branch: &str) -> Result<Option<CacheSlot>, FilesystemError> {
        read_json_opt(&self.slot_dir(branch).join(SLOT_FILE))
    }

    /// All slots, most recently used first.
    pub fn slots(&self) -> Result<Vec<CacheSlot>, FilesystemError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FilesystemError::io(&self.root)(e)),
        };
        let mut slots = Vec::new();
        for entry in entries {
            let entry = entry.map_err(FilesystemError::io(&self.root))?;
            if let Some(slot) = read_json_opt::<CacheSlot>(&entry.path().join(SLOT_FILE))? {
                slots.push(slot);
            }
        }
        slots.sort_by(|a, b| b.generation.cmp(&a.generation));
        Ok(slots)
    }

    fn next_generation(&self) -> Result<u64, FilesystemError> {
        Ok(self
            .slots()?
            .iter()
            .map(|s| s.generation)
            .max()
            .map_or(1, |g| g + 1))
    }

    /// Replaces the slot of `branch` with the current working tree.
    pub fn snapshot(
        &self,
        branch: &str,
        branch_hash: Option<String>,
        commit: Option<CommitHash>,
        worktree: &WorkTree,
    ) -> Result<CacheSlot, FilesystemError> {
        let generation = self.next_generation()?;
        let dir = self.slot_dir(branch);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FilesystemError::io(&dir)(e)),
        }
        fs::create_dir_all(&dir).map_err(FilesystemError::io(&dir))?;
        let copied = copy_artifacts(worktree.root(), &dir)?;
        let slot = CacheSlot {
            branch: branch.to_string(),
            branch_hash,
            commit,
            generation,
            last_used: Utc::now(),
        };
        write_json(&dir.join(SLOT_FILE), &slot)?;
        debug!(branch, files = copied, generation, "snapshotted working tree");
        Ok(slot)
    }

    /// Fills the working tree from the slot of `branch`, if there is one.
    pub fn restore(
        &self,
        branch: &str,
        worktree: &WorkTree,
    ) -> Result<Option<CacheSlot>, FilesystemError> {
        let Some(mut slot) = self.get(branch)? else {
            return Ok(None);
        };
        worktree.clear()?;
        let dir = self.slot_dir(branch);
        copy_artifacts(&dir, worktree.root())?;
        slot.generation = self.next_generation()?;
        slot.last_used = Utc::now();
        write_json(&dir.join(SLOT_FILE), &slot)?;
        debug!(branch, generation = slot.generation, "restored working tree from cache");
        Ok(Some(slot))
    }

    pub fn remove(&self, branch: &str) -> Result<bool, FilesystemError> {
        let dir = self.slot_dir(branch);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FilesystemError::io(&dir)(e)),
        }
    }

    /// Drops every slot beyond the `capacity` most recently used ones and
    /// returns the evicted branch names.
    pub fn evict(&self) -> Result<Vec<String>, FilesystemError> {
        let mut evicted = Vec::new();
        for slot in self.slots()?.into_iter().skip(self.capacity) {
            self.remove(&slot.branch)?;
            evicted.push(slot.branch);
        }
        Ok(evicted)
    }
}

/// Where the working tree of a checkout came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutSource {
    Cache,
    Remote,
    /// The branch has no commits yet.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub head: Head,
    pub source: CheckoutSource,
    pub evicted: Vec<String>,
}

impl Repository {
    /// The commit whose artifacts the working tree holds while `head` is
    /// checked out. Local commits on the branch win over HEAD, which only
    /// moves on push and checkout.
    fn worktree_commit(&self, head: &Head) -> Result<Option<CommitHash>, RepoError> {
        Ok(match self.store.branch_tip(&head.current_branch)? {
            Some(Commit::Draft(draft)) => draft.parent.commit().cloned(),
            Some(commit) => Some(commit.hash().clone()),
            None => head.previous_commit.commit().cloned(),
        })
    }

    /// Switches the working tree and HEAD to `branch`.
    ///
    /// The current branch's working tree is always snapshotted first. The
    /// target is restored from its cache slot unless `no_cache` is set or it
    /// has none, in which case its head artifacts are downloaded and cached.
    pub fn checkout<R: Remote + ?Sized>(
        &mut self,
        remote: &mut R,
        branch: &str,
        no_cache: bool,
    ) -> Result<Checkout, RepoError> {
        let head = self.head()?;
        let worktree = self.worktree();
        let cache = self.branch_cache();

        if worktree.has_artifacts() {
            cache.snapshot(
                &head.current_branch,
                head.branch_hash.clone(),
                self.worktree_commit(&head)?,
                &worktree,
            )?;
        }

        let cached = if no_cache {
            None
        } else {
            cache.restore(branch, &worktree)?
        };

        let (new_head, source) = match cached {
            Some(slot) => (
                Head {
                    current_branch: branch.to_string(),
                    branch_hash: slot.branch_hash,
                    previous_commit: slot.commit.map_or(Parent::Genesis, Parent::Commit),
                },
                CheckoutSource::Cache,
            ),
            None => {
                let target = remote
                    .branch_by_name(branch)?
                    .ok_or_else(|| RepoError::BranchNotFound(branch.to_string()))?;
                worktree.clear()?;
                let (commit, source) = match remote.fetch_artifacts(&target.branch_hash)? {
                    Some(artifacts) => {
                        if let Some(expected) = &artifacts.param_hash {
                            let actual = tensor::content_hash(&artifacts.params);
                            if &actual != expected {
                                return Err(IntegrityError {
                                    artifact: format!("params of branch {branch}"),
                                    expected: expected.clone(),
                                    actual,
                                }
                                .into());
                            }
                        }
                        worktree.write_params_bytes(&artifacts.params)?;
                        if let Some(proof) = &artifacts.proof {
                            worktree.write_proof(proof)?;
                        }
                        (Some(artifacts.commit), CheckoutSource::Remote)
                    }
                    None => (None, CheckoutSource::Empty),
                };
                cache.snapshot(
                    branch,
                    Some(target.branch_hash.clone()),
                    commit.clone(),
                    &worktree,
                )?;
                (
                    Head {
                        current_branch: branch.to_string(),
                        branch_hash: Some(target.branch_hash),
                        previous_commit: commit.map_or(Parent::Genesis, Parent::Commit),
                    },
                    source,
                )
            }
        };

        self.set_head(&new_head)?;
        let evicted = cache.evict()?;
        info!(branch, ?source, evicted = evicted.len(), "checked out branch");
        Ok(Checkout {
            head: new_head,
            source,
            evicted,
        })
    }
}

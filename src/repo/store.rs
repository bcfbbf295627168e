//! Local commit store.
//!
//! Commits live in one directory each under `.flair/commits/`, next to the
//! artifact files they own. Creation order is not inferred from the
//! directories themselves: every creation and removal is appended to
//! `index.log`, and the in-memory order is rebuilt by replaying that log.
//!
//! ```text
//! commits/
//!   index.log                      {"op":"create",...} / {"op":"remove",...}
//!   .lock                          advisory lock for mutations
//!   <hash>/commit.json
//!   <hash>/params.safetensors
//!   <hash>/.delta_params/delta.safetensors
//!   <hash>/proof.zlib, verification_key.zlib, settings.zlib
//! ```
//!
//! Mutating operations take an exclusive lock on `.lock` and re-read the log
//! while holding it, so two processes racing on `add` or `commit` serialize
//! instead of both observing "no draft".

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Retention;
use crate::delta;
use crate::error::{DraftStateError, FilesystemError, ReconstructionError, RepoError};
use crate::proof::ProofBundle;
use crate::repo::commit::{
    Commit, CommitHash, CommitKind, CommitRecord, CommitType, DeltaRef, DraftCommit,
    FinalizedCommit, ParamsRef, Parent, ZkpRef,
};
use crate::repo::{read_json, write_json};
use crate::tensor::{self, TensorMap};

pub const INDEX_FILE: &str = "index.log";
pub const LOCK_FILE: &str = ".lock";
pub const COMMIT_FILE: &str = "commit.json";
pub const PARAMS_FILE: &str = "params.safetensors";
pub const DELTA_FILE: &str = ".delta_params/delta.safetensors";
pub const PROOF_FILE: &str = "proof.zlib";
pub const VK_FILE: &str = "verification_key.zlib";
pub const SETTINGS_FILE: &str = "settings.zlib";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum IndexEntry {
    Create { hash: CommitHash, at: DateTime<Utc> },
    Remove { hash: CommitHash },
}

pub struct CommitStore {
    root: PathBuf,
    lock: File,
    order: Vec<CommitHash>,
    retention: Retention,
}

impl std::fmt::Debug for CommitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitStore")
            .field("root", &self.root)
            .field("commits", &self.order.len())
            .finish()
    }
}

impl CommitStore {
    /// Opens (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, retention: Retention) -> Result<Self, FilesystemError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(FilesystemError::io(&root))?;
        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(FilesystemError::io(&lock_path))?;
        let mut store = CommitStore {
            root,
            lock,
            order: Vec::new(),
            retention,
        };
        store.refresh()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Replays `index.log` into the in-memory creation order.
    pub fn refresh(&mut self) -> Result<(), FilesystemError> {
        let path = self.root.join(INDEX_FILE);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.order.clear();
                return Ok(());
            }
            Err(e) => return Err(FilesystemError::io(&path)(e)),
        };
        let mut order: Vec<CommitHash> = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(FilesystemError::io(&path))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = serde_json::from_str(&line).map_err(|e| {
                FilesystemError::corrupt(&path, format!("line {}: {e}", lineno + 1))
            })?;
            match entry {
                IndexEntry::Create { hash, .. } => {
                    if !order.contains(&hash) {
                        order.push(hash);
                    }
                }
                IndexEntry::Remove { hash } => order.retain(|h| h != &hash),
            }
        }
        self.order = order;
        Ok(())
    }

    /// Runs `f` while holding the exclusive store lock, with the index freshly
    /// replayed.
    pub fn with_lock<T, E>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, E>) -> Result<T, E>
    where
        E: From<FilesystemError>,
    {
        let lock_path = self.root.join(LOCK_FILE);
        self.lock.lock().map_err(FilesystemError::io(&lock_path))?;
        let res = (|| {
            self.refresh()?;
            f(self)
        })();
        let unlock_res = self.lock.unlock().map_err(FilesystemError::io(&lock_path));
        let out = res?;
        unlock_res?;
        Ok(out)
    }

    fn append_index(&self, entry: &IndexEntry) -> Result<(), FilesystemError> {
        let path = self.root.join(INDEX_FILE);
        let mut line = serde_json::to_string(entry)
            .map_err(|e| FilesystemError::corrupt(&path, e))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(FilesystemError::io(&path))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(FilesystemError::io(&path))
    }

    /// Commit hashes, oldest first.
    pub fn hashes(&self) -> &[CommitHash] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, hash: &CommitHash) -> bool {
        self.order.contains(hash)
    }

    pub fn commit_dir(&self, hash: &CommitHash) -> PathBuf {
        self.root.join(hash.as_str())
    }

    pub fn params_path(&self, hash: &CommitHash) -> PathBuf {
        self.commit_dir(hash).join(PARAMS_FILE)
    }

    pub fn delta_path(&self, hash: &CommitHash) -> PathBuf {
        self.commit_dir(hash).join(DELTA_FILE)
    }

    /// Proof, verification key and settings files, in that order.
    pub fn proof_paths(&self, hash: &CommitHash) -> [PathBuf; 3] {
        let dir = self.commit_dir(hash);
        [dir.join(PROOF_FILE), dir.join(VK_FILE), dir.join(SETTINGS_FILE)]
    }

    pub fn get(&self, hash: &CommitHash) -> Result<Commit, FilesystemError> {
        let path = self.commit_dir(hash).join(COMMIT_FILE);
        let record: CommitRecord = read_json(&path)?;
        if &record.commit_hash != hash {
            return Err(FilesystemError::corrupt(
                &path,
                format!("record names commit {}", record.commit_hash),
            ));
        }
        Commit::try_from(record).map_err(|reason| FilesystemError::corrupt(&path, reason))
    }

    /// All commits, oldest first.
    pub fn commits(&self) -> Result<Vec<Commit>, FilesystemError> {
        self.order.iter().map(|hash| self.get(hash)).collect()
    }

    pub fn latest(&self) -> Result<Option<Commit>, FilesystemError> {
        self.order.last().map(|hash| self.get(hash)).transpose()
    }

    /// The outstanding draft, if the newest commit is one.
    pub fn draft(&self) -> Result<Option<DraftCommit>, FilesystemError> {
        Ok(match self.latest()? {
            Some(Commit::Draft(draft)) => Some(draft),
            _ => None,
        })
    }

    pub fn save(&self, commit: &Commit) -> Result<(), FilesystemError> {
        let path = self.commit_dir(commit.hash()).join(COMMIT_FILE);
        write_json(&path, &CommitRecord::from(commit))
    }

    /// Whether every artifact a push of `commit` needs is on disk.
    pub fn is_complete(&self, commit: &FinalizedCommit) -> bool {
        let artifact = match commit.kind {
            CommitKind::Checkpoint => self.params_path(&commit.hash),
            CommitKind::Delta(_) => self.delta_path(&commit.hash),
        };
        artifact.is_file() && self.proof_paths(&commit.hash).iter().all(|p| p.is_file())
    }

    /// Newest commit made on `branch`.
    pub fn branch_tip(&self, branch: &str) -> Result<Option<Commit>, FilesystemError> {
        for hash in self.order.iter().rev() {
            let commit = self.get(hash)?;
            if commit.branch() == branch {
                return Ok(Some(commit));
            }
        }
        Ok(None)
    }

    /// The local commit `pointer` names, by local or remote hash. A commit
    /// that only exists remotely is returned as is.
    pub fn resolve(&self, pointer: &Parent) -> Result<Parent, FilesystemError> {
        let Some(hash) = pointer.commit() else {
            return Ok(Parent::Genesis);
        };
        for local in self.order.iter().rev() {
            let commit = self.get(local)?;
            if commit.hash() == hash || commit.remote_hash() == Some(hash) {
                return Ok(Parent::Commit(local.clone()));
            }
        }
        Ok(pointer.clone())
    }

    /// Starts a new draft on `branch`.
    ///
    /// The parent is the newest local commit on that branch. A branch without
    /// local commits continues from `base`, the commit HEAD points at.
    pub fn create_draft(
        &mut self,
        architecture: &str,
        branch: &str,
        base: &Parent,
    ) -> Result<CommitHash, RepoError> {
        self.with_lock(|store| {
            if let Some(draft) = store.draft()? {
                return Err(DraftStateError::OutstandingDraft(draft.hash).into());
            }
            let parent = match store.branch_tip(branch)? {
                Some(tip) => Parent::Commit(tip.hash().clone()),
                None => store.resolve(base)?,
            };
            let hash = CommitHash::generate();
            let dir = store.commit_dir(&hash);
            fs::create_dir_all(&dir).map_err(FilesystemError::io(&dir))?;
            let draft = Commit::Draft(DraftCommit {
                hash: hash.clone(),
                parent,
                branch: branch.to_string(),
                architecture: architecture.to_string(),
                params: None,
                zkp: None,
                created_at: Utc::now(),
            });
            store.save(&draft)?;
            store.append_index(&IndexEntry::Create {
                hash: hash.clone(),
                at: draft.created_at(),
            })?;
            store.order.push(hash.clone());
            info!(commit = %hash, branch, parent = %draft.parent(), "created draft commit");
            Ok(hash)
        })
    }

    /// Stores the full tensor map of the current draft.
    pub fn attach_params(
        &mut self,
        tensors: &TensorMap,
        framework: &str,
    ) -> Result<ParamsRef, RepoError> {
        self.with_lock(|store| {
            let mut draft = store.draft()?.ok_or(DraftStateError::NoDraft)?;
            if draft.params.is_some() {
                return Err(DraftStateError::ParamsAlreadyAttached(draft.hash).into());
            }
            let path = store.params_path(&draft.hash);
            tensor::save(&path, tensors)?;
            let hash = tensor::file_hash(&path).map_err(FilesystemError::io(&path))?;
            let params = ParamsRef {
                file: PARAMS_FILE.to_string(),
                hash,
                framework: framework.to_string(),
            };
            draft.params = Some(params.clone());
            store.save(&Commit::Draft(draft.clone()))?;
            debug!(commit = %draft.hash, tensors = tensors.len(), "attached params");
            Ok(params)
        })
    }

    /// Writes the proof artifacts of the current draft. A second call replaces
    /// the previous bundle.
    pub fn attach_proof(&mut self, bundle: &ProofBundle) -> Result<ZkpRef, RepoError> {
        self.with_lock(|store| {
            let mut draft = store.draft()?.ok_or(DraftStateError::NoDraft)?;
            let [proof, vk, settings] = store.proof_paths(&draft.hash);
            for (path, bytes) in [
                (&proof, &bundle.proof),
                (&vk, &bundle.verification_key),
                (&settings, &bundle.settings),
            ] {
                fs::write(path, bytes).map_err(FilesystemError::io(path))?;
            }
            let zkp = ZkpRef {
                proof_file: PROOF_FILE.to_string(),
                vk_file: VK_FILE.to_string(),
                settings_file: SETTINGS_FILE.to_string(),
                proof_cid: Some(tensor::content_hash(&bundle.proof)),
                vk_cid: Some(tensor::content_hash(&bundle.verification_key)),
                settings_cid: Some(tensor::content_hash(&bundle.settings)),
            };
            draft.zkp = Some(zkp.clone());
            store.save(&Commit::Draft(draft.clone()))?;
            debug!(commit = %draft.hash, "attached proof");
            Ok(zkp)
        })
    }

    /// Seals the current draft with `message`.
    ///
    /// The first commit of a history becomes a checkpoint, and so does a commit
    /// whose parent is not in the store (a branch head that was only
    /// downloaded). Every other commit stores its delta against the parent's
    /// full params, which are rebuilt from history if they were already
    /// pruned. Full-param pruning runs after every delta commit.
    pub fn finalize(&mut self, message: &str) -> Result<CommitType, RepoError> {
        self.with_lock(|store| {
            let draft = match store.latest()? {
                Some(Commit::Draft(draft)) => draft,
                Some(commit) => {
                    return Err(DraftStateError::AlreadyFinalized(commit.hash().clone()).into())
                }
                None => return Err(DraftStateError::NoDraft.into()),
            };
            if message.trim().is_empty() {
                return Err(DraftStateError::EmptyMessage.into());
            }
            let params = draft
                .params
                .clone()
                .ok_or_else(|| DraftStateError::MissingParams(draft.hash.clone()))?;
            let zkp = draft
                .zkp
                .clone()
                .ok_or_else(|| DraftStateError::MissingProof(draft.hash.clone()))?;

            let local_parent = draft.parent.commit().filter(|p| store.contains(p));
            let kind = match local_parent {
                None => {
                    if let Some(parent) = draft.parent.commit() {
                        debug!(commit = %draft.hash, %parent, "parent not held locally, storing a checkpoint");
                    }
                    CommitKind::Checkpoint
                }
                Some(parent) => {
                    let previous = store.full_params(parent)?;
                    let current = tensor::load(&store.params_path(&draft.hash))?;
                    let delta = delta::compute_delta(&previous, &current)?;
                    let path = store.delta_path(&draft.hash);
                    delta::save_delta(&path, &delta)?;
                    let hash = tensor::file_hash(&path).map_err(FilesystemError::io(&path))?;
                    CommitKind::Delta(DeltaRef {
                        file: DELTA_FILE.to_string(),
                        hash,
                        previous_commit_hash: parent.clone(),
                    })
                }
            };

            let commit = FinalizedCommit {
                hash: draft.hash,
                parent: draft.parent,
                branch: draft.branch,
                architecture: draft.architecture,
                params,
                zkp,
                message: message.to_string(),
                kind,
                created_at: draft.created_at,
            };
            let commit_type = commit.commit_type();
            store.save(&Commit::Finalized(commit.clone()))?;
            info!(commit = %commit.hash, %commit_type, "finalized commit");

            if commit_type == CommitType::Delta {
                let window = store.retention.full_params_window;
                store.prune_full_params_locked(window)?;
            }
            Ok(commit_type)
        })
    }

    /// Makes sure the full params blob of `hash` is on disk, rebuilding it
    /// when it was pruned, and returns its file hash.
    pub fn materialize_params(&mut self, hash: &CommitHash) -> Result<String, RepoError> {
        self.with_lock(|store| {
            let path = store.params_path(hash);
            if !path.is_file() {
                let full = store.reconstruct(hash)?;
                tensor::save(&path, &full)?;
                debug!(commit = %hash, "restored full params");
            }
            Ok(tensor::file_hash(&path).map_err(FilesystemError::io(&path))?)
        })
    }

    /// Records that `hash` now exists remotely as `remote_hash`.
    pub fn mark_pushed(
        &mut self,
        hash: &CommitHash,
        remote_hash: &CommitHash,
    ) -> Result<(), RepoError> {
        self.with_lock(|store| store.mark_pushed_locked(hash, remote_hash))
    }

    pub(crate) fn mark_pushed_locked(
        &mut self,
        hash: &CommitHash,
        remote_hash: &CommitHash,
    ) -> Result<(), RepoError> {
        let commit = self
            .get(hash)?
            .finalized()
            .cloned()
            .ok_or_else(|| ReconstructionError::NotFinalized(hash.clone()))?;
        self.save(&Commit::Pushed {
            commit,
            remote_hash: remote_hash.clone(),
        })?;
        Ok(())
    }

    /// Deletes a commit directory and logs its removal.
    pub(crate) fn remove_locked(&mut self, hash: &CommitHash) -> Result<(), FilesystemError> {
        let dir = self.commit_dir(hash);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(FilesystemError::io(&dir)(e)),
        }
        self.append_index(&IndexEntry::Remove { hash: hash.clone() })?;
        self.order.retain(|h| h != hash);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CommitStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CommitStore::open(dir.path().join("commits"), Retention::default()).unwrap();
        (dir, store)
    }

    fn commit_on(store: &mut CommitStore, branch: &str, base: &Parent, value: f32) -> CommitHash {
        let hash = store.create_draft("safetensors", branch, base).unwrap();
        let tensors = TensorMap::from([("w".to_string(), tensor::Tensor::vector_f32(vec![value]))]);
        store.attach_params(&tensors, "safetensors").unwrap();
        store
            .attach_proof(&ProofBundle {
                proof: value.to_le_bytes().to_vec(),
                verification_key: b"vk".to_vec(),
                settings: b"{}".to_vec(),
            })
            .unwrap();
        store.finalize("step").unwrap();
        hash
    }

    #[test]
    fn drafts_follow_their_own_branch() {
        let (_dir, mut store) = store();
        let m1 = commit_on(&mut store, "main", &Parent::Genesis, 1.0);
        let e1 = commit_on(&mut store, "exp", &Parent::Commit(m1.clone()), 2.0);
        let m2 = commit_on(&mut store, "main", &Parent::Genesis, 3.0);
        let e2 = commit_on(&mut store, "exp", &Parent::Genesis, 4.0);

        assert_eq!(store.get(&e1).unwrap().parent(), &Parent::Commit(m1.clone()));
        assert_eq!(store.get(&m2).unwrap().parent(), &Parent::Commit(m1));
        assert_eq!(store.get(&e2).unwrap().parent(), &Parent::Commit(e1));
        assert_eq!(store.get(&e2).unwrap().commit_type(), Some(CommitType::Delta));
        assert_eq!(store.reconstruct(&e2).unwrap()["w"], tensor::Tensor::vector_f32(vec![4.0]));
    }

    #[test]
    fn base_resolves_through_remote_hash() {
        let (_dir, mut store) = store();
        let first = commit_on(&mut store, "main", &Parent::Genesis, 1.0);
        let remote = CommitHash::new("remote-1");
        store.mark_pushed(&first, &remote).unwrap();
        assert_eq!(
            store.resolve(&Parent::Commit(remote)).unwrap(),
            Parent::Commit(first)
        );
    }

    #[test]
    fn unknown_parent_finalizes_as_checkpoint() {
        let (_dir, mut store) = store();
        commit_on(&mut store, "main", &Parent::Genesis, 1.0);
        let foreign = Parent::Commit(CommitHash::new("downloaded-head"));
        let hash = commit_on(&mut store, "exp", &foreign, 5.0);

        let commit = store.get(&hash).unwrap();
        assert_eq!(commit.parent(), &foreign);
        assert_eq!(commit.commit_type(), Some(CommitType::Checkpoint));
        assert!(!store.delta_path(&hash).exists());
        assert_eq!(store.reconstruct(&hash).unwrap()["w"], tensor::Tensor::vector_f32(vec![5.0]));
    }

    #[test]
    fn materialize_restores_pruned_params() {
        let (_dir, mut store) = store();
        commit_on(&mut store, "main", &Parent::Genesis, 1.0);
        let second = commit_on(&mut store, "main", &Parent::Genesis, 2.0);
        commit_on(&mut store, "main", &Parent::Genesis, 3.0);
        store.prune_full_params(0).unwrap();
        assert!(!store.params_path(&second).exists());

        let hash = store.materialize_params(&second).unwrap();
        let path = store.params_path(&second);
        assert_eq!(hash, tensor::file_hash(&path).unwrap());
        assert_eq!(tensor::load(&path).unwrap()["w"], tensor::Tensor::vector_f32(vec![2.0]));
    }

    #[test]
    fn index_replay_restores_order() {
        let (dir, mut store) = store();
        let a = store.create_draft("safetensors", "main", &Parent::Genesis).unwrap();
        store.with_lock(|s| s.remove_locked(&a)).unwrap();
        let b = store.create_draft("safetensors", "main", &Parent::Genesis).unwrap();

        let reopened = CommitStore::open(dir.path().join("commits"), Retention::default()).unwrap();
        assert_eq!(reopened.hashes(), &[b]);
    }

    #[test]
    fn second_draft_is_rejected() {
        let (_dir, mut store) = store();
        let first = store.create_draft("safetensors", "main", &Parent::Genesis).unwrap();
        let err = store.create_draft("safetensors", "main", &Parent::Genesis).unwrap_err();
        assert!(matches!(
            err,
            RepoError::DraftState(DraftStateError::OutstandingDraft(ref h)) if h == &first
        ));
    }

    #[test]
    fn params_cannot_be_attached_twice() {
        let (_dir, mut store) = store();
        store.create_draft("safetensors", "main", &Parent::Genesis).unwrap();
        let tensors = TensorMap::from([("w".to_string(), tensor::Tensor::vector_f32(vec![1.0]))]);
        store.attach_params(&tensors, "safetensors").unwrap();
        let err = store.attach_params(&tensors, "safetensors").unwrap_err();
        assert!(matches!(
            err,
            RepoError::DraftState(DraftStateError::ParamsAlreadyAttached(_))
        ));
    }

    #[test]
    fn finalize_requires_params_and_proof() {
        let (_dir, mut store) = store();
        assert!(matches!(
            store.finalize("msg").unwrap_err(),
            RepoError::DraftState(DraftStateError::NoDraft)
        ));
        store.create_draft("safetensors", "main", &Parent::Genesis).unwrap();
        assert!(matches!(
            store.finalize("msg").unwrap_err(),
            RepoError::DraftState(DraftStateError::MissingParams(_))
        ));
        let tensors = TensorMap::from([("w".to_string(), tensor::Tensor::vector_f32(vec![1.0]))]);
        store.attach_params(&tensors, "safetensors").unwrap();
        assert!(matches!(
            store.finalize("msg").unwrap_err(),
            RepoError::DraftState(DraftStateError::MissingProof(_))
        ));
    }
}

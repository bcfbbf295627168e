//! Uploading local history to a remote branch.
//!
//! A push first resolves the target branch (creating it when missing) and
//! asks the remote for its head. Local commits up to and including the one
//! the remote head names are already published and are skipped. The rest are
//! uploaded oldest first, each through its own commit-creation transaction,
//! until the queue is exhausted or a commit that is not complete on disk is
//! reached (the active draft, typically).
//!
//! Only commits made on the checked out branch are considered. A DELTA
//! commit is only uploaded as a delta when its parent is the commit the
//! remote head names. When the remote head was moved by someone else, the
//! commit's full params are uploaded as a CHECKPOINT instead, so the remote
//! never replays a delta onto the wrong base.
//!
//! Every commit the remote finalizes is recorded locally as pushed right
//! away, so an interrupted push resumes after it. HEAD only moves once the
//! whole queue went through, after which horizon pruning runs.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::error::{FilesystemError, IntegrityError, RemoteProtocolError, RepoError};
use crate::remote::{
    Branch, CreateBranch, FinalizeRequest, ProofAddresses, ProofFiles, PushStep, Remote,
    RemoteError, Session,
};
use crate::repo::commit::{Commit, CommitHash, CommitKind, CommitType, FinalizedCommit, Parent};
use crate::repo::store::CommitStore;
use crate::repo::{Head, Repository, DEFAULT_BRANCH};
use crate::tensor;

/// Outcome of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub branch: Branch,
    /// Local hash and remote hash of every commit uploaded, in order.
    pub pushed: Vec<(CommitHash, CommitHash)>,
    /// First commit left behind because it is not complete.
    pub halted_at: Option<CommitHash>,
    /// Commits removed by horizon pruning afterwards.
    pub pruned: Vec<CommitHash>,
    pub head: Head,
}

/// Progress of one commit through the commit-creation transaction.
enum Transaction {
    Start,
    Initiated {
        session: Session,
    },
    ProofChecked {
        session: Session,
        zkml_token: String,
    },
    ProofUploaded {
        session: Session,
        zkml_receipt: String,
    },
    ParamsUploaded {
        session: Session,
        zkml_receipt: String,
        params_receipt: String,
        param_hash: String,
    },
    Done(CommitHash),
}

/// One commit ready for upload.
struct Upload<'a> {
    store: &'a CommitStore,
    commit: &'a FinalizedCommit,
    branch_hash: &'a str,
    parent: &'a Parent,
    /// Type the remote records, which may differ from the local one.
    commit_type: CommitType,
    /// Params or delta file, with the hash it must have.
    artifact: PathBuf,
    recorded: String,
}

impl Upload<'_> {
    fn protocol(&self, step: PushStep) -> impl FnOnce(RemoteError) -> RepoError + '_ {
        move |source| {
            RemoteProtocolError {
                step,
                commit: self.commit.hash.clone(),
                source,
            }
            .into()
        }
    }

    fn addresses(&self) -> Result<ProofAddresses, RepoError> {
        let [proof, vk, settings] = self.store.proof_paths(&self.commit.hash);
        let cid = |recorded: &Option<String>, path: &PathBuf| -> Result<String, RepoError> {
            match recorded {
                Some(cid) => Ok(cid.clone()),
                None => Ok(tensor::file_hash(path).map_err(FilesystemError::io(path))?),
            }
        };
        Ok(ProofAddresses {
            proof_cid: cid(&self.commit.zkp.proof_cid, &proof)?,
            vk_cid: cid(&self.commit.zkp.vk_cid, &vk)?,
            settings_cid: cid(&self.commit.zkp.settings_cid, &settings)?,
        })
    }

    fn advance<R: Remote + ?Sized>(
        &self,
        remote: &mut R,
        state: Transaction,
    ) -> Result<Transaction, RepoError> {
        let branch = self.branch_hash;
        Ok(match state {
            Transaction::Start => {
                let session = remote
                    .initiate(branch, self.parent)
                    .map_err(self.protocol(PushStep::Initiate))?;
                Transaction::Initiated { session }
            }
            Transaction::Initiated { session } => {
                let addresses = self.addresses()?;
                let zkml_token = remote
                    .zkml_check(branch, &session, &addresses)
                    .map_err(self.protocol(PushStep::ZkmlCheck))?;
                Transaction::ProofChecked {
                    session,
                    zkml_token,
                }
            }
            Transaction::ProofChecked {
                session,
                zkml_token,
            } => {
                let [proof, vk, settings] = self.store.proof_paths(&self.commit.hash);
                let files = ProofFiles {
                    proof: &proof,
                    verification_key: &vk,
                    settings: &settings,
                };
                let zkml_receipt = remote
                    .zkml_upload(branch, &session, &zkml_token, files)
                    .map_err(self.protocol(PushStep::ZkmlUpload))?;
                Transaction::ProofUploaded {
                    session,
                    zkml_receipt,
                }
            }
            Transaction::ProofUploaded {
                session,
                zkml_receipt,
            } => {
                let path = &self.artifact;
                let param_hash = tensor::file_hash(path).map_err(FilesystemError::io(path))?;
                if param_hash != self.recorded {
                    return Err(IntegrityError {
                        artifact: path.display().to_string(),
                        expected: self.recorded.clone(),
                        actual: param_hash,
                    }
                    .into());
                }
                let receipt = remote
                    .params_upload(branch, &session, &zkml_receipt, path, &param_hash)
                    .map_err(self.protocol(PushStep::ParamsUpload))?;
                if let Some(echoed) = &receipt.param_hash {
                    if echoed != &param_hash {
                        return Err(IntegrityError {
                            artifact: format!("params of commit {}", self.commit.hash),
                            expected: param_hash,
                            actual: echoed.clone(),
                        }
                        .into());
                    }
                }
                Transaction::ParamsUploaded {
                    session,
                    zkml_receipt,
                    params_receipt: receipt.params_receipt_token,
                    param_hash,
                }
            }
            Transaction::ParamsUploaded {
                session,
                zkml_receipt,
                params_receipt,
                param_hash,
            } => {
                let request = FinalizeRequest {
                    commit_hash: self.commit.hash.clone(),
                    message: self.commit.message.clone(),
                    param_hash,
                    architecture: self.commit.architecture.clone(),
                    commit_type: self.commit_type,
                    initiate_token: session.initiate_token.clone(),
                    zkml_receipt_token: zkml_receipt,
                    params_receipt_token: params_receipt,
                };
                let remote_hash = remote
                    .finalize(branch, &session, &request)
                    .map_err(self.protocol(PushStep::Finalize))?;
                if remote_hash != self.commit.hash {
                    debug!(local = %self.commit.hash, remote = %remote_hash, "remote renamed commit");
                }
                Transaction::Done(remote_hash)
            }
            Transaction::Done(hash) => Transaction::Done(hash),
        })
    }

    fn run<R: Remote + ?Sized>(&self, remote: &mut R) -> Result<CommitHash, RepoError> {
        let mut state = Transaction::Start;
        loop {
            state = self.advance(remote, state)?;
            if let Transaction::Done(hash) = state {
                return Ok(hash);
            }
        }
    }
}

impl Repository {
    /// Uploads every complete, unpushed local commit to `branch` (HEAD's
    /// branch when `None`).
    pub fn push<R: Remote + ?Sized>(
        &mut self,
        remote: &mut R,
        branch: Option<&str>,
    ) -> Result<PushReport, RepoError> {
        let head = self.head()?;
        let name = match branch {
            Some(name) => name.to_string(),
            None if !head.current_branch.is_empty() => head.current_branch.clone(),
            None => DEFAULT_BRANCH.to_string(),
        };

        let target = match remote.branch_by_name(&name)? {
            Some(branch) => branch,
            None => {
                info!(branch = %name, "creating remote branch");
                let created = remote.create_branch(&CreateBranch {
                    name: name.clone(),
                    current_branch_hash: head.branch_hash.clone(),
                    description: Some("Created via push".to_string()),
                })?;
                self.refresh_branches(remote)?;
                created
            }
        };

        let local_branch = if head.current_branch.is_empty() {
            DEFAULT_BRANCH
        } else {
            head.current_branch.as_str()
        };
        let remote_head = remote.latest_commit(&target.branch_hash)?;
        let commits: Vec<Commit> = self
            .store
            .commits()?
            .into_iter()
            .filter(|c| c.branch() == local_branch)
            .collect();

        let mut start = 0;
        let mut parent = Parent::Genesis;
        if let Some(remote_head) = &remote_head {
            parent = Parent::Commit(remote_head.commit_hash.clone());
            let matched = commits.iter().rposition(|c| {
                c.hash() == &remote_head.commit_hash
                    || c.remote_hash() == Some(&remote_head.commit_hash)
            });
            if let Some(pos) = matched {
                // Published through another clone or by an interrupted push.
                for (i, commit) in commits[..=pos].iter().enumerate() {
                    if let Commit::Finalized(c) = commit {
                        let remote_hash = if i == pos {
                            remote_head.commit_hash.clone()
                        } else {
                            c.hash.clone()
                        };
                        self.store.mark_pushed(&c.hash, &remote_hash)?;
                    }
                }
                start = pos + 1;
            }
        }

        let mut queue = Vec::new();
        let mut halted_at = None;
        for commit in &commits[start..] {
            match commit {
                Commit::Pushed { .. } => continue,
                Commit::Finalized(c) if self.store.is_complete(c) => queue.push(c.clone()),
                other => {
                    halted_at = Some(other.hash().clone());
                    break;
                }
            }
        }
        if let Some(hash) = &halted_at {
            debug!(commit = %hash, "stopping queue at incomplete commit");
        }

        // Local commit the parent seed stands for, when there is one.
        let mut anchor = match self.store.resolve(&parent)? {
            Parent::Commit(hash) if self.store.contains(&hash) => Some(hash),
            _ => None,
        };

        let mut pushed = Vec::with_capacity(queue.len());
        for commit in &queue {
            let follows = commit.parent == parent
                || commit.parent.commit().is_some_and(|p| anchor.as_ref() == Some(p));
            let (commit_type, artifact, recorded) = match &commit.kind {
                CommitKind::Checkpoint => (
                    CommitType::Checkpoint,
                    self.store.params_path(&commit.hash),
                    commit.params.hash.clone(),
                ),
                CommitKind::Delta(delta) if follows => (
                    CommitType::Delta,
                    self.store.delta_path(&commit.hash),
                    delta.hash.clone(),
                ),
                CommitKind::Delta(_) => {
                    warn!(
                        commit = %commit.hash,
                        parent = %commit.parent,
                        remote_head = %parent,
                        "remote head is not the delta base, uploading full params"
                    );
                    let recorded = self.store.materialize_params(&commit.hash)?;
                    (
                        CommitType::Checkpoint,
                        self.store.params_path(&commit.hash),
                        recorded,
                    )
                }
            };
            let upload = Upload {
                store: &self.store,
                commit,
                branch_hash: &target.branch_hash,
                parent: &parent,
                commit_type,
                artifact,
                recorded,
            };
            let remote_hash = match upload.run(remote) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(commit = %commit.hash, error = %e, "push aborted");
                    return Err(e);
                }
            };
            self.store.mark_pushed(&commit.hash, &remote_hash)?;
            info!(commit = %commit.hash, remote = %remote_hash, "pushed commit");
            parent = Parent::Commit(remote_hash.clone());
            anchor = Some(commit.hash.clone());
            pushed.push((commit.hash.clone(), remote_hash));
        }

        let new_head = Head {
            current_branch: target.name.clone(),
            branch_hash: Some(target.branch_hash.clone()),
            previous_commit: parent,
        };
        if new_head != head {
            self.set_head(&new_head)?;
        }
        let horizon = self.config.retention.commit_horizon;
        let pruned = self.store.prune_horizon(horizon)?;

        Ok(PushReport {
            branch: target,
            pushed,
            halted_at,
            pruned,
            head: new_head,
        })
    }
}

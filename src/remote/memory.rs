use std::collections::HashMap;
use std::fs;
use std::path::Path;

use uuid::Uuid;

use super::{
    Branch, BranchArtifacts, CreateBranch, FinalizeRequest, ParamsReceipt, ProofAddresses,
    ProofFiles, PushStep, Remote, RemoteCommit, RemoteError, RepositoryInfo, Session,
};
use crate::delta;
use crate::proof::ProofBundle;
use crate::repo::commit::{CommitHash, CommitType, Parent};
use crate::tensor::{self, TensorMap};

/// In-memory ledger implementing [`Remote`].
///
/// Useful for tests: it enforces the token chain of the commit-creation
/// transaction, rejects finalizes whose parent is not the branch head and
/// can be told to fail a given step.
#[derive(Debug)]
pub struct MemoryRemote {
    pub info: RepositoryInfo,
    branches: Vec<Branch>,
    commits: HashMap<String, Vec<StoredCommit>>,
    sessions: HashMap<String, PendingSession>,
    failure: Option<(PushStep, usize)>,
    echo_override: Option<String>,
    served_override: Option<String>,
    /// Every push step served, in order.
    pub calls: Vec<PushStep>,
}

#[derive(Debug, Clone)]
struct StoredCommit {
    remote: RemoteCommit,
    artifact: Vec<u8>,
    proof: ProofBundle,
}

#[derive(Debug, Default)]
struct PendingSession {
    branch_hash: String,
    parent: Option<Parent>,
    initiate_token: String,
    zkml_token: Option<String>,
    zkml_receipt: Option<String>,
    params_receipt: Option<String>,
    proof: Option<ProofBundle>,
    artifact: Option<(Vec<u8>, String)>,
}

fn status(status: u16, message: impl Into<String>) -> RemoteError {
    RemoteError::Status {
        status,
        message: message.into(),
    }
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

impl MemoryRemote {
    /// A ledger holding one repository with an empty `main` branch.
    pub fn new(repo: &str) -> Self {
        let main = Branch {
            name: "main".to_string(),
            branch_hash: new_token(),
            description: None,
            parent_branch_hash: None,
            latest_commit: None,
        };
        MemoryRemote {
            info: RepositoryInfo {
                hash: repo.to_string(),
                name: repo.to_string(),
                default_branch_hash: Some(main.branch_hash.clone()),
                base_model: None,
            },
            branches: vec![main],
            commits: HashMap::new(),
            sessions: HashMap::new(),
            failure: None,
            echo_override: None,
            served_override: None,
            calls: Vec::new(),
        }
    }

    /// Let `skip` further calls of `step` succeed, then fail the next one.
    pub fn fail_step(&mut self, step: PushStep, skip: usize) {
        self.failure = Some((step, skip));
    }

    /// Echo `hash` from PARAMS_UPLOAD instead of the real artifact hash.
    pub fn echo_param_hash(&mut self, hash: impl Into<String>) {
        self.echo_override = Some(hash.into());
    }

    /// Advertise `hash` with every artifact download instead of the real one.
    pub fn serve_param_hash(&mut self, hash: impl Into<String>) {
        self.served_override = Some(hash.into());
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.name == name)
    }

    /// Commits of a branch, oldest first.
    pub fn history(&self, branch_hash: &str) -> Vec<RemoteCommit> {
        self.commits
            .get(branch_hash)
            .map(|c| c.iter().map(|s| s.remote.clone()).collect())
            .unwrap_or_default()
    }

    /// Creates branch `name` whose head is a checkpoint holding `params`.
    pub fn seed_branch(
        &mut self,
        name: &str,
        params: &TensorMap,
        proof: ProofBundle,
    ) -> Result<Branch, RemoteError> {
        let artifact = tensor::encode(params, None).map_err(|e| status(400, e.to_string()))?;
        let branch = Branch {
            name: name.to_string(),
            branch_hash: new_token(),
            description: None,
            parent_branch_hash: None,
            latest_commit: None,
        };
        self.branches.push(branch.clone());
        self.append(
            &branch.branch_hash,
            StoredCommit {
                remote: RemoteCommit {
                    commit_hash: CommitHash::generate(),
                    previous_commit_hash: Some(Parent::Genesis),
                    commit_type: Some(CommitType::Checkpoint),
                    message: Some(format!("seed {name}")),
                    param_hash: Some(tensor::content_hash(&artifact)),
                },
                artifact,
                proof,
            },
        );
        Ok(self.branch(name).cloned().unwrap_or(branch))
    }

    fn append(&mut self, branch_hash: &str, commit: StoredCommit) {
        let hash = commit.remote.commit_hash.clone();
        self.commits
            .entry(branch_hash.to_string())
            .or_default()
            .push(commit);
        if let Some(branch) = self.branches.iter_mut().find(|b| b.branch_hash == branch_hash) {
            branch.latest_commit = Some(hash);
        }
    }

    fn enter(&mut self, step: PushStep) -> Result<(), RemoteError> {
        self.calls.push(step);
        if let Some((failing, skip)) = self.failure {
            if failing == step {
                if skip == 0 {
                    self.failure = None;
                    return Err(status(500, format!("injected failure at {step}")));
                }
                self.failure = Some((failing, skip - 1));
            }
        }
        Ok(())
    }

    fn known_branch(&self, branch_hash: &str) -> Result<(), RemoteError> {
        if self.branches.iter().any(|b| b.branch_hash == branch_hash) {
            Ok(())
        } else {
            Err(status(404, format!("branch {branch_hash} not found")))
        }
    }

    fn session(
        &mut self,
        branch_hash: &str,
        session: &Session,
    ) -> Result<&mut PendingSession, RemoteError> {
        let pending = self
            .sessions
            .get_mut(&session.session_id)
            .ok_or_else(|| status(404, "unknown session"))?;
        if pending.initiate_token != session.initiate_token || pending.branch_hash != branch_hash
        {
            return Err(status(401, "initiate token rejected"));
        }
        Ok(pending)
    }

    /// Full params of the newest commit on a branch.
    fn materialize(&self, branch_hash: &str) -> Result<Option<(CommitHash, Vec<u8>)>, RemoteError> {
        let Some(history) = self.commits.get(branch_hash) else {
            return Ok(None);
        };
        let Some(head) = history.last() else {
            return Ok(None);
        };
        let start = history
            .iter()
            .rposition(|c| c.remote.commit_type != Some(CommitType::Delta))
            .ok_or_else(|| status(500, "branch history has no checkpoint"))?;
        let decode_err = |e: delta::DeltaError| status(500, e.to_string());
        let (mut mapping, _) =
            tensor::decode(&history[start].artifact).map_err(|e| status(500, e.to_string()))?;
        for commit in &history[start + 1..] {
            let step = delta::decode_delta(&commit.artifact).map_err(decode_err)?;
            delta::apply_delta(&mut mapping, &step).map_err(decode_err)?;
        }
        let bytes = tensor::encode(&mapping, None).map_err(|e| status(500, e.to_string()))?;
        Ok(Some((head.remote.commit_hash.clone(), bytes)))
    }
}

fn read(path: &Path) -> Result<Vec<u8>, RemoteError> {
    fs::read(path).map_err(|source| RemoteError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl Remote for MemoryRemote {
    fn repository(&mut self) -> Result<RepositoryInfo, RemoteError> {
        Ok(self.info.clone())
    }

    fn list_branches(&mut self) -> Result<Vec<Branch>, RemoteError> {
        Ok(self.branches.clone())
    }

    fn branch_by_name(&mut self, name: &str) -> Result<Option<Branch>, RemoteError> {
        Ok(self.branch(name).cloned())
    }

    fn create_branch(&mut self, request: &CreateBranch) -> Result<Branch, RemoteError> {
        if self.branch(&request.name).is_some() {
            return Err(status(409, format!("branch {} already exists", request.name)));
        }
        let parent = match &request.current_branch_hash {
            Some(hash) => self.branches.iter().find(|b| &b.branch_hash == hash).cloned(),
            None => None,
        };
        let branch = Branch {
            name: request.name.clone(),
            branch_hash: new_token(),
            description: request.description.clone(),
            parent_branch_hash: parent.as_ref().map(|p| p.branch_hash.clone()),
            latest_commit: parent.as_ref().and_then(|p| p.latest_commit.clone()),
        };
        if let Some(parent) = parent {
            let inherited = self.commits.get(&parent.branch_hash).cloned().unwrap_or_default();
            self.commits.insert(branch.branch_hash.clone(), inherited);
        }
        self.branches.push(branch.clone());
        Ok(branch)
    }

    fn delete_branch(&mut self, branch_hash: &str) -> Result<(), RemoteError> {
        self.known_branch(branch_hash)?;
        self.branches.retain(|b| b.branch_hash != branch_hash);
        self.commits.remove(branch_hash);
        Ok(())
    }

    fn latest_commit(&mut self, branch_hash: &str) -> Result<Option<RemoteCommit>, RemoteError> {
        self.known_branch(branch_hash)?;
        Ok(self
            .commits
            .get(branch_hash)
            .and_then(|c| c.last())
            .map(|c| c.remote.clone()))
    }

    fn list_commits(&mut self, branch_hash: &str) -> Result<Vec<RemoteCommit>, RemoteError> {
        self.known_branch(branch_hash)?;
        Ok(self.history(branch_hash))
    }

    fn initiate(&mut self, branch_hash: &str, parent: &Parent) -> Result<Session, RemoteError> {
        self.enter(PushStep::Initiate)?;
        self.known_branch(branch_hash)?;
        let session = Session {
            session_id: new_token(),
            initiate_token: new_token(),
        };
        self.sessions.insert(
            session.session_id.clone(),
            PendingSession {
                branch_hash: branch_hash.to_string(),
                parent: Some(parent.clone()),
                initiate_token: session.initiate_token.clone(),
                ..PendingSession::default()
            },
        );
        Ok(session)
    }

    fn zkml_check(
        &mut self,
        branch_hash: &str,
        session: &Session,
        addresses: &ProofAddresses,
    ) -> Result<String, RemoteError> {
        self.enter(PushStep::ZkmlCheck)?;
        let duplicate = self.commits.get(branch_hash).is_some_and(|history| {
            history
                .iter()
                .any(|c| tensor::content_hash(&c.proof.proof) == addresses.proof_cid)
        });
        if duplicate {
            return Err(status(409, "proof already used on this branch"));
        }
        let pending = self.session(branch_hash, session)?;
        let token = new_token();
        pending.zkml_token = Some(token.clone());
        Ok(token)
    }

    fn zkml_upload(
        &mut self,
        branch_hash: &str,
        session: &Session,
        zkml_token: &str,
        files: ProofFiles<'_>,
    ) -> Result<String, RemoteError> {
        self.enter(PushStep::ZkmlUpload)?;
        let bundle = ProofBundle {
            proof: read(files.proof)?,
            verification_key: read(files.verification_key)?,
            settings: read(files.settings)?,
        };
        let pending = self.session(branch_hash, session)?;
        if pending.zkml_token.as_deref() != Some(zkml_token) {
            return Err(status(401, "zkml token rejected"));
        }
        let receipt = new_token();
        pending.proof = Some(bundle);
        pending.zkml_receipt = Some(receipt.clone());
        Ok(receipt)
    }

    fn params_upload(
        &mut self,
        branch_hash: &str,
        session: &Session,
        zkml_receipt_token: &str,
        artifact: &Path,
        _param_hash: &str,
    ) -> Result<ParamsReceipt, RemoteError> {
        self.enter(PushStep::ParamsUpload)?;
        let bytes = read(artifact)?;
        let echoed = self
            .echo_override
            .clone()
            .unwrap_or_else(|| tensor::content_hash(&bytes));
        let pending = self.session(branch_hash, session)?;
        if pending.zkml_receipt.as_deref() != Some(zkml_receipt_token) {
            return Err(status(401, "zkml receipt rejected"));
        }
        let receipt = new_token();
        pending.artifact = Some((bytes, echoed.clone()));
        pending.params_receipt = Some(receipt.clone());
        Ok(ParamsReceipt {
            params_receipt_token: receipt,
            param_hash: Some(echoed),
        })
    }

    fn finalize(
        &mut self,
        branch_hash: &str,
        session: &Session,
        request: &FinalizeRequest,
    ) -> Result<CommitHash, RemoteError> {
        self.enter(PushStep::Finalize)?;
        let head = self
            .commits
            .get(branch_hash)
            .and_then(|c| c.last())
            .map(|c| Parent::Commit(c.remote.commit_hash.clone()))
            .unwrap_or(Parent::Genesis);
        let pending = self.session(branch_hash, session)?;
        if pending.zkml_receipt.as_deref() != Some(request.zkml_receipt_token.as_str())
            || pending.params_receipt.as_deref() != Some(request.params_receipt_token.as_str())
            || pending.initiate_token != request.initiate_token
        {
            return Err(status(401, "receipt tokens rejected"));
        }
        if pending.parent.as_ref() != Some(&head) {
            return Err(status(409, "branch head moved since initiate"));
        }
        let (Some(proof), Some((artifact, _))) = (pending.proof.take(), pending.artifact.take())
        else {
            return Err(status(400, "session is missing uploads"));
        };
        let parent = pending.parent.take();
        self.sessions.remove(&session.session_id);
        self.append(
            branch_hash,
            StoredCommit {
                remote: RemoteCommit {
                    commit_hash: request.commit_hash.clone(),
                    previous_commit_hash: parent,
                    commit_type: Some(request.commit_type),
                    message: Some(request.message.clone()),
                    param_hash: Some(request.param_hash.clone()),
                },
                artifact,
                proof,
            },
        );
        Ok(request.commit_hash.clone())
    }

    fn fetch_artifacts(
        &mut self,
        branch_hash: &str,
    ) -> Result<Option<BranchArtifacts>, RemoteError> {
        self.known_branch(branch_hash)?;
        let Some((commit, params)) = self.materialize(branch_hash)? else {
            return Ok(None);
        };
        let proof = self
            .commits
            .get(branch_hash)
            .and_then(|c| c.last())
            .map(|c| c.proof.clone());
        Ok(Some(BranchArtifacts {
            commit,
            param_hash: Some(
                self.served_override
                    .clone()
                    .unwrap_or_else(|| tensor::content_hash(&params)),
            ),
            params,
            proof,
        }))
    }
}

//! The remote ledger as seen from the client.
//!
//! A [`Remote`] is bound to one repository on the ledger. It exposes branch
//! CRUD, commit lookup, artifact download for checkout and the five calls of
//! the commit-creation transaction:
//!
//! ```text
//! INITIATE -> ZKML_CHECK -> ZKML_UPLOAD -> PARAMS_UPLOAD -> FINALIZE
//! ```
//!
//! Each call returns the token the next one has to present. Nothing is rolled
//! back when a later step fails; the remote keeps whatever it acknowledged.
//!
//! [`http::HttpRemote`] talks to the real service, [`memory::MemoryRemote`]
//! keeps a complete ledger in process and is what the tests push against.

pub mod http;
pub mod memory;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proof::ProofBundle;
use crate::repo::commit::{CommitHash, CommitType, Parent};

/// One step of the commit-creation transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushStep {
    Initiate,
    ZkmlCheck,
    ZkmlUpload,
    ParamsUpload,
    Finalize,
}

impl PushStep {
    pub const ALL: [PushStep; 5] = [
        PushStep::Initiate,
        PushStep::ZkmlCheck,
        PushStep::ZkmlUpload,
        PushStep::ParamsUpload,
        PushStep::Finalize,
    ];

    /// Path segment under `.../commits/create/`.
    pub fn endpoint(self) -> &'static str {
        match self {
            PushStep::Initiate => "initiate",
            PushStep::ZkmlCheck => "zkml-check",
            PushStep::ZkmlUpload => "zkml-upload",
            PushStep::ParamsUpload => "params-upload",
            PushStep::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PushStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PushStep::Initiate => "INITIATE",
            PushStep::ZkmlCheck => "ZKML_CHECK",
            PushStep::ZkmlUpload => "ZKML_UPLOAD",
            PushStep::ParamsUpload => "PARAMS_UPLOAD",
            PushStep::Finalize => "FINALIZE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("remote response lacks `{0}`")]
    MissingField(&'static str),
    #[error("unexpected remote response: {0}")]
    Decode(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Status { status: 404, .. })
    }
}

/// Repository record, cached locally as `repo.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    pub hash: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub name: String,
    pub branch_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_commit: Option<CommitHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_branch_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A commit as recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommit {
    pub commit_hash: CommitHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_commit_hash: Option<Parent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<CommitType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_hash: Option<String>,
}

/// Handle returned by INITIATE and presented by every later step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub initiate_token: String,
}

/// Content addresses of the three proof files, sent to ZKML_CHECK.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofAddresses {
    pub proof_cid: String,
    pub vk_cid: String,
    pub settings_cid: String,
}

/// Proof files uploaded by ZKML_UPLOAD.
#[derive(Debug, Clone, Copy)]
pub struct ProofFiles<'a> {
    pub proof: &'a Path,
    pub verification_key: &'a Path,
    pub settings: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsReceipt {
    pub params_receipt_token: String,
    /// Hash of the uploaded artifact as computed by the remote, when echoed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub commit_hash: CommitHash,
    pub message: String,
    pub param_hash: String,
    pub architecture: String,
    pub commit_type: CommitType,
    pub initiate_token: String,
    pub zkml_receipt_token: String,
    pub params_receipt_token: String,
}

/// Working artifacts of a branch head, as served for checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchArtifacts {
    pub commit: CommitHash,
    /// Full params of the head commit, safetensors encoded.
    pub params: Vec<u8>,
    pub param_hash: Option<String>,
    pub proof: Option<ProofBundle>,
}

pub trait Remote {
    fn repository(&mut self) -> Result<RepositoryInfo, RemoteError>;

    fn list_branches(&mut self) -> Result<Vec<Branch>, RemoteError>;

    fn branch_by_name(&mut self, name: &str) -> Result<Option<Branch>, RemoteError>;

    fn create_branch(&mut self, request: &CreateBranch) -> Result<Branch, RemoteError>;

    fn delete_branch(&mut self, branch_hash: &str) -> Result<(), RemoteError>;

    /// Head commit of a branch, `None` while the branch is empty.
    fn latest_commit(&mut self, branch_hash: &str) -> Result<Option<RemoteCommit>, RemoteError>;

    fn list_commits(&mut self, branch_hash: &str) -> Result<Vec<RemoteCommit>, RemoteError>;

    fn initiate(&mut self, branch_hash: &str, parent: &Parent) -> Result<Session, RemoteError>;

    /// Returns the ZKML token.
    fn zkml_check(
        &mut self,
        branch_hash: &str,
        session: &Session,
        addresses: &ProofAddresses,
    ) -> Result<String, RemoteError>;

    /// Returns the ZKML receipt token.
    fn zkml_upload(
        &mut self,
        branch_hash: &str,
        session: &Session,
        zkml_token: &str,
        files: ProofFiles<'_>,
    ) -> Result<String, RemoteError>;

    fn params_upload(
        &mut self,
        branch_hash: &str,
        session: &Session,
        zkml_receipt_token: &str,
        artifact: &Path,
        param_hash: &str,
    ) -> Result<ParamsReceipt, RemoteError>;

    /// Returns the hash under which the ledger recorded the commit.
    fn finalize(
        &mut self,
        branch_hash: &str,
        session: &Session,
        request: &FinalizeRequest,
    ) -> Result<CommitHash, RemoteError>;

    /// Artifacts of the branch head, `None` while the branch is empty.
    fn fetch_artifacts(&mut self, branch_hash: &str)
        -> Result<Option<BranchArtifacts>, RemoteError>;
}

//! Commit records and their lifecycle.
//!
//! On disk a commit is a loosely shaped JSON document ([`CommitRecord`]) so
//! that drafts can be filled in step by step. Everything outside the store
//! works with the validated [`Commit`] instead, which only admits the shapes a
//! commit can legally have at each stage of its life.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel parent of the first commit in a history.
pub const GENESIS: &str = "_GENESIS_COMMIT_";

/// Locally generated commit identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn generate() -> Self {
        CommitHash(Uuid::new_v4().to_string())
    }

    pub fn new(hash: impl Into<String>) -> Self {
        CommitHash(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parent link of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Parent {
    Genesis,
    Commit(CommitHash),
}

impl Parent {
    pub fn commit(&self) -> Option<&CommitHash> {
        match self {
            Parent::Genesis => None,
            Parent::Commit(hash) => Some(hash),
        }
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, Parent::Genesis)
    }
}

impl From<String> for Parent {
    fn from(value: String) -> Self {
        if value == GENESIS || value.is_empty() {
            Parent::Genesis
        } else {
            Parent::Commit(CommitHash(value))
        }
    }
}

impl From<Parent> for String {
    fn from(value: Parent) -> Self {
        match value {
            Parent::Genesis => GENESIS.to_string(),
            Parent::Commit(hash) => hash.0,
        }
    }
}

impl fmt::Display for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Genesis => f.write_str(GENESIS),
            Parent::Commit(hash) => hash.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitType {
    Checkpoint,
    Delta,
}

impl fmt::Display for CommitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitType::Checkpoint => f.pad("CHECKPOINT"),
            CommitType::Delta => f.pad("DELTA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitStatus {
    Created,
    Finalized,
    Pushed,
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitStatus::Created => f.pad("CREATED"),
            CommitStatus::Finalized => f.pad("FINALIZED"),
            CommitStatus::Pushed => f.pad("PUSHED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsRef {
    pub file: String,
    pub hash: String,
    pub framework: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaRef {
    pub file: String,
    pub hash: String,
    pub previous_commit_hash: CommitHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZkpRef {
    pub proof_file: String,
    pub vk_file: String,
    pub settings_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vk_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_cid: Option<String>,
}

/// The `commit.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub commit_hash: CommitHash,
    pub previous_commit_hash: Parent,
    /// Local branch the commit was made on.
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<CommitType>,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParamsRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_params: Option<DeltaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zkp: Option<ZkpRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: CommitStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_commit_hash: Option<CommitHash>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftCommit {
    pub hash: CommitHash,
    pub parent: Parent,
    pub branch: String,
    pub architecture: String,
    pub params: Option<ParamsRef>,
    pub zkp: Option<ZkpRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitKind {
    Checkpoint,
    Delta(DeltaRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedCommit {
    pub hash: CommitHash,
    pub parent: Parent,
    pub branch: String,
    pub architecture: String,
    pub params: ParamsRef,
    pub zkp: ZkpRef,
    pub message: String,
    pub kind: CommitKind,
    pub created_at: DateTime<Utc>,
}

impl FinalizedCommit {
    pub fn commit_type(&self) -> CommitType {
        match self.kind {
            CommitKind::Checkpoint => CommitType::Checkpoint,
            CommitKind::Delta(_) => CommitType::Delta,
        }
    }
}

/// A commit at one of its three lifecycle stages.
#[derive(Debug, Clone, PartialEq)]
pub enum Commit {
    Draft(DraftCommit),
    Finalized(FinalizedCommit),
    Pushed {
        commit: FinalizedCommit,
        remote_hash: CommitHash,
    },
}

impl Commit {
    pub fn hash(&self) -> &CommitHash {
        match self {
            Commit::Draft(d) => &d.hash,
            Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => &c.hash,
        }
    }

    pub fn parent(&self) -> &Parent {
        match self {
            Commit::Draft(d) => &d.parent,
            Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => &c.parent,
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            Commit::Draft(d) => &d.branch,
            Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => &c.branch,
        }
    }

    pub fn status(&self) -> CommitStatus {
        match self {
            Commit::Draft(_) => CommitStatus::Created,
            Commit::Finalized(_) => CommitStatus::Finalized,
            Commit::Pushed { .. } => CommitStatus::Pushed,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Commit::Draft(d) => d.created_at,
            Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => c.created_at,
        }
    }

    /// The finalized part of the commit, `None` for drafts.
    pub fn finalized(&self) -> Option<&FinalizedCommit> {
        match self {
            Commit::Draft(_) => None,
            Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => Some(c),
        }
    }

    pub fn commit_type(&self) -> Option<CommitType> {
        self.finalized().map(FinalizedCommit::commit_type)
    }

    pub fn remote_hash(&self) -> Option<&CommitHash> {
        match self {
            Commit::Pushed { remote_hash, .. } => Some(remote_hash),
            _ => None,
        }
    }

    pub fn is_pushed(&self) -> bool {
        matches!(self, Commit::Pushed { .. })
    }
}

impl TryFrom<CommitRecord> for Commit {
    type Error = String;

    fn try_from(record: CommitRecord) -> Result<Self, Self::Error> {
        if record.status == CommitStatus::Created {
            return Ok(Commit::Draft(DraftCommit {
                hash: record.commit_hash,
                parent: record.previous_commit_hash,
                branch: record.branch,
                architecture: record.architecture,
                params: record.params,
                zkp: record.zkp,
                created_at: record.created_at,
            }));
        }

        let hash = record.commit_hash;
        let message = record
            .message
            .ok_or_else(|| format!("finalized commit {hash} has no message"))?;
        let params = record
            .params
            .ok_or_else(|| format!("finalized commit {hash} has no params"))?;
        let zkp = record
            .zkp
            .ok_or_else(|| format!("finalized commit {hash} has no proof"))?;
        let kind = match record.commit_type {
            Some(CommitType::Checkpoint) => CommitKind::Checkpoint,
            Some(CommitType::Delta) => CommitKind::Delta(
                record
                    .delta_params
                    .ok_or_else(|| format!("delta commit {hash} has no delta params"))?,
            ),
            None => return Err(format!("finalized commit {hash} has no commit type")),
        };
        let commit = FinalizedCommit {
            hash,
            parent: record.previous_commit_hash,
            branch: record.branch,
            architecture: record.architecture,
            params,
            zkp,
            message,
            kind,
            created_at: record.created_at,
        };

        match record.status {
            CommitStatus::Finalized => Ok(Commit::Finalized(commit)),
            CommitStatus::Pushed => {
                let remote_hash = record
                    .remote_commit_hash
                    .ok_or_else(|| format!("pushed commit {} has no remote hash", commit.hash))?;
                Ok(Commit::Pushed {
                    commit,
                    remote_hash,
                })
            }
            CommitStatus::Created => unreachable!("drafts handled above"),
        }
    }
}

impl From<&Commit> for CommitRecord {
    fn from(commit: &Commit) -> Self {
        match commit {
            Commit::Draft(d) => CommitRecord {
                commit_hash: d.hash.clone(),
                previous_commit_hash: d.parent.clone(),
                branch: d.branch.clone(),
                commit_type: None,
                architecture: d.architecture.clone(),
                params: d.params.clone(),
                delta_params: None,
                zkp: d.zkp.clone(),
                message: None,
                status: CommitStatus::Created,
                created_at: d.created_at,
                remote_commit_hash: None,
            },
            Commit::Finalized(c) | Commit::Pushed { commit: c, .. } => CommitRecord {
                commit_hash: c.hash.clone(),
                previous_commit_hash: c.parent.clone(),
                branch: c.branch.clone(),
                commit_type: Some(c.commit_type()),
                architecture: c.architecture.clone(),
                params: Some(c.params.clone()),
                delta_params: match &c.kind {
                    CommitKind::Checkpoint => None,
                    CommitKind::Delta(d) => Some(d.clone()),
                },
                zkp: Some(c.zkp.clone()),
                message: Some(c.message.clone()),
                status: commit.status(),
                created_at: c.created_at,
                remote_commit_hash: commit.remote_hash().cloned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalized_record() -> CommitRecord {
        CommitRecord {
            commit_hash: CommitHash::new("c1"),
            previous_commit_hash: Parent::Commit(CommitHash::new("c0")),
            branch: "main".into(),
            commit_type: Some(CommitType::Delta),
            architecture: "safetensors".into(),
            params: Some(ParamsRef {
                file: "params.safetensors".into(),
                hash: "aa".into(),
                framework: "safetensors".into(),
            }),
            delta_params: Some(DeltaRef {
                file: ".delta_params/delta.safetensors".into(),
                hash: "bb".into(),
                previous_commit_hash: CommitHash::new("c0"),
            }),
            zkp: Some(ZkpRef {
                proof_file: "proof.zlib".into(),
                vk_file: "verification_key.zlib".into(),
                settings_file: "settings.zlib".into(),
                proof_cid: None,
                vk_cid: None,
                settings_cid: None,
            }),
            message: Some("tune".into()),
            status: CommitStatus::Finalized,
            created_at: Utc::now(),
            remote_commit_hash: None,
        }
    }

    #[test]
    fn genesis_sentinel_in_json() {
        let mut record = finalized_record();
        record.previous_commit_hash = Parent::Genesis;
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["previousCommitHash"], GENESIS);
        assert_eq!(json["commitType"], "DELTA");

        let back: CommitRecord = serde_json::from_value(json).unwrap();
        assert!(back.previous_commit_hash.is_genesis());
    }

    #[test]
    fn finalized_record_validates() {
        let commit = Commit::try_from(finalized_record()).unwrap();
        assert_eq!(commit.status(), CommitStatus::Finalized);
        assert_eq!(commit.commit_type(), Some(CommitType::Delta));
        assert_eq!(CommitRecord::from(&commit), finalized_record_with(&commit));
    }

    fn finalized_record_with(commit: &Commit) -> CommitRecord {
        let mut record = finalized_record();
        record.created_at = commit.created_at();
        record
    }

    #[test]
    fn delta_without_delta_params_is_rejected() {
        let mut record = finalized_record();
        record.delta_params = None;
        assert!(Commit::try_from(record).is_err());
    }

    #[test]
    fn finalized_without_message_is_rejected() {
        let mut record = finalized_record();
        record.message = None;
        assert!(Commit::try_from(record).is_err());
    }

    #[test]
    fn pushed_requires_remote_hash() {
        let mut record = finalized_record();
        record.status = CommitStatus::Pushed;
        assert!(Commit::try_from(record.clone()).is_err());

        record.remote_commit_hash = Some(CommitHash::new("r1"));
        let commit = Commit::try_from(record).unwrap();
        assert_eq!(commit.remote_hash(), Some(&CommitHash::new("r1")));
    }

    #[test]
    fn drafts_may_be_partial() {
        let mut record = finalized_record();
        record.status = CommitStatus::Created;
        record.params = None;
        record.message = None;
        let commit = Commit::try_from(record).unwrap();
        assert!(commit.finalized().is_none());
    }
}

#![allow(dead_code)]

use std::collections::BTreeMap;

use tempfile::TempDir;

use flair::config::Config;
use flair::proof::ProofBundle;
use flair::remote::memory::MemoryRemote;
use flair::repo::commit::CommitHash;
use flair::repo::Repository;
use flair::tensor::{Tensor, TensorData, TensorMap};

/// A repository in a temporary directory, initialized against an in-memory
/// ledger.
pub struct Fixture {
    pub dir: TempDir,
    pub repo: Repository,
    pub remote: MemoryRemote,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = MemoryRemote::new("repo-1");
        let repo = Repository::init_from_remote(dir.path(), &mut remote, config).unwrap();
        Fixture { dir, repo, remote }
    }

    /// Runs add, params, proof and commit for one set of weights.
    pub fn commit(&mut self, weights: &TensorMap, message: &str) -> CommitHash {
        commit_to(&mut self.repo, weights, message)
    }

    /// A second working copy of the same remote repository.
    pub fn clone_repo(&mut self) -> (TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo =
            Repository::init_from_remote(dir.path(), &mut self.remote, Config::default()).unwrap();
        (dir, repo)
    }

    /// Commits `count` successive weight sets `[i, i+1, i+2]`.
    pub fn commit_series(&mut self, count: usize) -> Vec<CommitHash> {
        (0..count)
            .map(|i| self.commit(&weights(i as f32), &format!("step {i}")))
            .collect()
    }
}

/// Runs add, params, proof and commit on `repo`. `message` also seeds the
/// proof bytes, so it must be unique per remote branch.
pub fn commit_to(repo: &mut Repository, weights: &TensorMap, message: &str) -> CommitHash {
    let hash = repo.add().unwrap();
    repo.attach_params(weights, "safetensors").unwrap();
    repo.attach_proof(&proof(message)).unwrap();
    repo.commit(message).unwrap();
    hash
}

/// A small model whose float tensor is `[base, base + 1, base + 2]`.
///
/// Values stay integral so deltas replay exactly.
pub fn weights(base: f32) -> TensorMap {
    let mut map = BTreeMap::new();
    map.insert(
        "layer.weight".to_string(),
        Tensor::vector_f32(vec![base, base + 1.0, base + 2.0]),
    );
    map.insert(
        "layer.steps".to_string(),
        Tensor::new(vec![1], TensorData::I64(vec![base as i64 * 10])).unwrap(),
    );
    map
}

/// A proof bundle whose bytes are unique to `tag`.
pub fn proof(tag: &str) -> ProofBundle {
    ProofBundle {
        proof: format!("proof:{tag}").into_bytes(),
        verification_key: format!("vk:{tag}").into_bytes(),
        settings: b"{\"run_args\":{}}".to_vec(),
    }
}

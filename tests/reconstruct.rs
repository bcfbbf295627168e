mod util;

use std::fs;
use std::io::Write;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flair::error::{ReconstructionError, RepoError};
use flair::repo::commit::{Commit, CommitType};
use flair::repo::store::INDEX_FILE;
use flair::tensor::{Tensor, TensorData, TensorMap};
use util::{weights, Fixture};

#[test]
fn first_commit_is_checkpoint_then_deltas() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(3);
    let types: Vec<_> = fx
        .repo
        .log()
        .unwrap()
        .iter()
        .map(|c| c.commit_type())
        .collect();
    assert_eq!(
        types,
        vec![
            Some(CommitType::Checkpoint),
            Some(CommitType::Delta),
            Some(CommitType::Delta)
        ]
    );
    assert_eq!(hashes.len(), 3);
}

#[test]
fn pruned_commits_reconstruct_exactly() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(4);
    let store = fx.repo.store();

    // window of two: the checkpoint and the two newest keep full params
    assert!(store.params_path(&hashes[0]).is_file());
    assert!(!store.params_path(&hashes[1]).exists());
    assert!(store.params_path(&hashes[2]).is_file());
    assert!(store.params_path(&hashes[3]).is_file());

    for (i, hash) in hashes.iter().enumerate() {
        assert_eq!(fx.repo.reconstruct(hash).unwrap(), weights(i as f32), "commit {i}");
    }
}

#[test]
fn worktree_follows_latest_commit() {
    let mut fx = Fixture::new();
    fx.commit_series(3);
    let worktree = fx.repo.worktree();
    assert_eq!(worktree.params().unwrap(), weights(2.0));
    assert!(worktree.proof_paths().iter().all(|p| p.is_file()));
}

#[test]
fn zero_window_still_reconstructs_every_commit() {
    let mut config = flair::Config::default();
    config.retention.full_params_window = 0;
    let mut fx = Fixture::with_config(config);
    let hashes = fx.commit_series(5);
    for hash in &hashes[1..] {
        assert!(!fx.repo.store().params_path(hash).exists());
    }
    assert_eq!(fx.repo.reconstruct(&hashes[4]).unwrap(), weights(4.0));
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(4.0));
}

#[test]
fn missing_delta_is_reported() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(3);
    fs::remove_file(fx.repo.store().delta_path(&hashes[1])).unwrap();

    let err = fx.repo.reconstruct(&hashes[2]).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Reconstruction(ReconstructionError::MissingDelta(ref h)) if h == &hashes[1]
    ));
}

#[test]
fn missing_parent_breaks_the_chain() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(3);

    let index = fx.repo.store().root().join(INDEX_FILE);
    let mut file = fs::OpenOptions::new().append(true).open(&index).unwrap();
    writeln!(file, r#"{{"op":"remove","hash":"{}"}}"#, hashes[1]).unwrap();
    drop(file);
    fx.repo.store_mut().refresh().unwrap();

    let err = fx.repo.reconstruct(&hashes[2]).unwrap_err();
    match err {
        RepoError::Reconstruction(ReconstructionError::BrokenChain { commit, parent }) => {
            assert_eq!(commit, hashes[2]);
            assert_eq!(parent, hashes[1]);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unknown_commit_is_reported() {
    let mut fx = Fixture::new();
    fx.commit_series(1);
    let err = fx
        .repo
        .reconstruct(&flair::repo::commit::CommitHash::new("nope"))
        .unwrap_err();
    assert!(matches!(
        err,
        RepoError::Reconstruction(ReconstructionError::UnknownCommit(_))
    ));
}

#[test]
fn drafts_cannot_be_reconstructed() {
    let mut fx = Fixture::new();
    fx.commit_series(1);
    let draft = fx.repo.add().unwrap();
    let err = fx.repo.reconstruct(&draft).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Reconstruction(ReconstructionError::NotFinalized(_))
    ));
}

#[test]
fn chain_stops_at_nearest_checkpoint() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(4);
    let chain = fx.repo.store().chain_to_checkpoint(&hashes[3]).unwrap();
    let chain: Vec<_> = chain.into_iter().map(|c| c.hash).collect();
    assert_eq!(chain, hashes);

    let last = fx.repo.log().unwrap().pop().unwrap();
    assert!(matches!(last, Commit::Finalized(_)));
}

#[test]
fn removed_and_added_tensors_replay() {
    let mut fx = Fixture::new();
    let first = weights(1.0);
    let mut second = weights(2.0);
    second.remove("layer.steps");
    second.insert(
        "head.bias".to_string(),
        Tensor::vector_f32(vec![0.5, -0.5]),
    );
    let a = fx.commit(&first, "a");
    let b = fx.commit(&second, "b");
    fx.commit(&weights(3.0), "c");
    fx.commit(&weights(4.0), "d");

    assert_eq!(fx.repo.reconstruct(&a).unwrap(), first);
    assert_eq!(fx.repo.reconstruct(&b).unwrap(), second);
    assert_eq!(fx.repo.reconstruct(&b).unwrap().len(), 2);
}

#[test]
fn random_integer_history_reconstructs_after_pruning() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut config = flair::Config::default();
    config.retention.full_params_window = 1;
    let mut fx = Fixture::with_config(config);

    let mut values: Vec<i64> = (0..16).map(|_| rng.gen()).collect();
    let mut expected = Vec::new();
    for step in 0..12 {
        for _ in 0..rng.gen_range(1..4) {
            let i = rng.gen_range(0..values.len());
            values[i] = values[i].wrapping_add(rng.gen());
        }
        let map = TensorMap::from([(
            "embedding".to_string(),
            Tensor::new(vec![4, 4], TensorData::I64(values.clone())).unwrap(),
        )]);
        let hash = fx.commit(&map, &format!("random {step}"));
        expected.push((hash, map));
    }

    for (hash, map) in &expected {
        assert_eq!(&fx.repo.reconstruct(hash).unwrap(), map);
    }
}

fn w_map(entries: &[(&str, &[f32])]) -> TensorMap {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Tensor::vector_f32(v.to_vec())))
        .collect()
}

#[test]
fn checkpoint_then_two_deltas() {
    let mut fx = Fixture::new();
    let k = fx.commit(&w_map(&[("w", &[1.0, 2.0, 3.0])]), "K");
    let d1 = fx.commit(&w_map(&[("w", &[1.0, 2.0, 5.0])]), "D1");
    let d2 = fx.commit(&w_map(&[("w", &[2.0, 2.0, 5.0]), ("v", &[9.0])]), "D2");

    let store = fx.repo.store();
    let delta1 = flair::delta::load_delta(&store.delta_path(&d1)).unwrap();
    assert_eq!(delta1.tensors, w_map(&[("w", &[0.0, 0.0, 2.0])]));
    let delta2 = flair::delta::load_delta(&store.delta_path(&d2)).unwrap();
    assert_eq!(delta2.tensors, w_map(&[("w", &[1.0, 0.0, 0.0]), ("v", &[9.0])]));

    let pruned = fx.repo.store_mut().prune_full_params(1).unwrap();
    assert_eq!(pruned, vec![d1.clone()]);

    assert_eq!(fx.repo.reconstruct(&k).unwrap(), w_map(&[("w", &[1.0, 2.0, 3.0])]));
    assert_eq!(fx.repo.reconstruct(&d1).unwrap(), w_map(&[("w", &[1.0, 2.0, 5.0])]));
    assert_eq!(
        fx.repo.reconstruct(&d2).unwrap(),
        w_map(&[("w", &[2.0, 2.0, 5.0]), ("v", &[9.0])])
    );
}

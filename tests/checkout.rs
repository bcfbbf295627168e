mod util;

use flair::error::RepoError;
use flair::repo::cache::CheckoutSource;
use flair::repo::commit::{CommitType, Parent};
use flair::Config;
use util::{proof, weights, Fixture};

fn with_slots(slots: usize) -> Fixture {
    let mut config = Config::default();
    config.cache.slots = slots;
    Fixture::with_config(config)
}

#[test]
fn checkout_downloads_then_uses_cache() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(3);
    fx.repo.push(&mut fx.remote, None).unwrap();
    let seeded = fx
        .remote
        .seed_branch("exp", &weights(42.0), proof("exp"))
        .unwrap();

    let checkout = fx.repo.checkout(&mut fx.remote, "exp", false).unwrap();
    assert_eq!(checkout.source, CheckoutSource::Remote);
    assert_eq!(checkout.head.current_branch, "exp");
    assert_eq!(checkout.head.branch_hash, Some(seeded.branch_hash));
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(42.0));

    // main was snapshotted on the way out
    let back = fx.repo.checkout(&mut fx.remote, "main", false).unwrap();
    assert_eq!(back.source, CheckoutSource::Cache);
    assert_eq!(back.head.previous_commit, Parent::Commit(hashes[2].clone()));
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(2.0));
    assert!(fx.repo.worktree().proof_paths().iter().all(|p| p.is_file()));
    assert_eq!(fx.repo.head().unwrap(), back.head);
}

#[test]
fn no_cache_always_downloads() {
    let mut fx = Fixture::new();
    fx.remote
        .seed_branch("exp", &weights(1.0), proof("exp"))
        .unwrap();
    fx.repo.checkout(&mut fx.remote, "exp", false).unwrap();
    fx.repo.checkout(&mut fx.remote, "main", false).unwrap();

    let again = fx.repo.checkout(&mut fx.remote, "exp", true).unwrap();
    assert_eq!(again.source, CheckoutSource::Remote);
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(1.0));
}

#[test]
fn cache_keeps_only_most_recent_branches() {
    let mut fx = with_slots(2);
    for (i, name) in ["b1", "b2", "b3"].iter().enumerate() {
        fx.remote
            .seed_branch(name, &weights(i as f32), proof(name))
            .unwrap();
    }

    let first = fx.repo.checkout(&mut fx.remote, "b1", false).unwrap();
    assert!(first.evicted.is_empty());
    fx.repo.checkout(&mut fx.remote, "b2", false).unwrap();
    let third = fx.repo.checkout(&mut fx.remote, "b3", false).unwrap();
    assert_eq!(third.evicted, vec!["b1".to_string()]);

    let cached: Vec<_> = fx
        .repo
        .branch_cache()
        .slots()
        .unwrap()
        .into_iter()
        .map(|s| s.branch)
        .collect();
    assert_eq!(cached, vec!["b3".to_string(), "b2".to_string()]);

    let b2 = fx.repo.checkout(&mut fx.remote, "b2", false).unwrap();
    assert_eq!(b2.source, CheckoutSource::Cache);
    let b1 = fx.repo.checkout(&mut fx.remote, "b1", false).unwrap();
    assert_eq!(b1.source, CheckoutSource::Remote);
    assert_eq!(b1.evicted, vec!["b3".to_string()]);
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(0.0));
}

#[test]
fn empty_branch_checks_out_empty() {
    let mut fx = Fixture::new();
    fx.repo.create_branch(&mut fx.remote, "fresh").unwrap();
    let checkout = fx.repo.checkout(&mut fx.remote, "fresh", false).unwrap();
    assert_eq!(checkout.source, CheckoutSource::Empty);
    assert_eq!(checkout.head.previous_commit, Parent::Genesis);
    assert!(!fx.repo.worktree().has_artifacts());
}

#[test]
fn unknown_branch_is_an_error() {
    let mut fx = Fixture::new();
    let err = fx
        .repo
        .checkout(&mut fx.remote, "missing", false)
        .unwrap_err();
    assert!(matches!(err, RepoError::BranchNotFound(ref name) if name == "missing"));
    assert_eq!(fx.repo.head().unwrap().current_branch, "main");
}

#[test]
fn branch_create_and_delete() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(2);
    fx.repo.push(&mut fx.remote, None).unwrap();

    let branch = fx.repo.create_branch(&mut fx.remote, "side").unwrap();
    assert_eq!(branch.latest_commit.as_ref(), Some(&hashes[1]));
    assert!(fx
        .repo
        .cached_branches()
        .unwrap()
        .iter()
        .any(|b| b.name == "side"));

    fx.repo.checkout(&mut fx.remote, "side", false).unwrap();
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(1.0));

    let err = fx.repo.delete_branch(&mut fx.remote, "side").unwrap_err();
    assert!(matches!(err, RepoError::BranchCheckedOut(_)));

    fx.repo.checkout(&mut fx.remote, "main", false).unwrap();
    assert!(fx.repo.branch_cache().get("side").unwrap().is_some());
    fx.repo.delete_branch(&mut fx.remote, "side").unwrap();
    assert!(fx.remote.branch("side").is_none());
    assert!(fx.repo.branch_cache().get("side").unwrap().is_none());
    assert!(fx
        .repo
        .cached_branches()
        .unwrap()
        .iter()
        .all(|b| b.name != "side"));
}

#[test]
fn commits_after_checkout_build_on_that_branch() {
    let mut fx = Fixture::new();
    fx.commit_series(2);
    fx.repo.push(&mut fx.remote, None).unwrap();
    fx.remote
        .seed_branch("exp", &weights(42.0), proof("exp"))
        .unwrap();
    let checkout = fx.repo.checkout(&mut fx.remote, "exp", false).unwrap();

    // the downloaded head is not a local commit, so there is nothing to diff against
    let first = fx.commit(&weights(50.0), "exp 50");
    let commit = fx.repo.store().get(&first).unwrap();
    assert_eq!(commit.branch(), "exp");
    assert_eq!(commit.parent(), &checkout.head.previous_commit);
    assert_eq!(commit.commit_type(), Some(CommitType::Checkpoint));

    let second = fx.commit(&weights(60.0), "exp 60");
    let commit = fx.repo.store().get(&second).unwrap();
    assert_eq!(commit.parent(), &Parent::Commit(first));
    assert_eq!(commit.commit_type(), Some(CommitType::Delta));

    let report = fx.repo.push(&mut fx.remote, None).unwrap();
    assert_eq!(report.branch.name, "exp");
    assert_eq!(report.pushed.len(), 2);

    fx.repo.checkout(&mut fx.remote, "main", false).unwrap();
    fx.repo.checkout(&mut fx.remote, "exp", true).unwrap();
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(60.0));
    fx.repo.checkout(&mut fx.remote, "main", true).unwrap();
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(1.0));
}

#[test]
fn switching_back_continues_the_original_branch() {
    let mut fx = Fixture::new();
    let hashes = fx.commit_series(2);
    fx.repo.push(&mut fx.remote, None).unwrap();
    fx.remote
        .seed_branch("exp", &weights(42.0), proof("exp"))
        .unwrap();
    fx.repo.checkout(&mut fx.remote, "exp", false).unwrap();
    let on_exp = fx.commit(&weights(50.0), "exp 50");

    fx.repo.checkout(&mut fx.remote, "main", false).unwrap();
    let next = fx.commit(&weights(7.0), "main 7");
    let commit = fx.repo.store().get(&next).unwrap();
    assert_eq!(commit.parent(), &Parent::Commit(hashes[1].clone()));
    assert_eq!(commit.commit_type(), Some(CommitType::Delta));

    let report = fx.repo.push(&mut fx.remote, None).unwrap();
    assert_eq!(report.branch.name, "main");
    assert_eq!(report.pushed, vec![(next.clone(), next)]);
    assert!(!fx.repo.store().get(&on_exp).unwrap().is_pushed());

    fx.repo.checkout(&mut fx.remote, "main", true).unwrap();
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(7.0));
}

#[test]
fn cached_slot_remembers_unpushed_local_commit() {
    let mut fx = Fixture::new();
    fx.commit_series(2);
    fx.repo.push(&mut fx.remote, None).unwrap();
    let local = fx.commit(&weights(7.0), "local");
    fx.remote
        .seed_branch("exp", &weights(42.0), proof("exp"))
        .unwrap();

    fx.repo.checkout(&mut fx.remote, "exp", false).unwrap();
    let back = fx.repo.checkout(&mut fx.remote, "main", false).unwrap();
    assert_eq!(back.source, CheckoutSource::Cache);
    assert_eq!(back.head.previous_commit, Parent::Commit(local));
    assert_eq!(fx.repo.worktree().params().unwrap(), weights(7.0));
}

#[test]
fn download_with_wrong_hash_is_rejected() {
    let mut fx = Fixture::new();
    fx.remote
        .seed_branch("exp", &weights(3.0), proof("exp"))
        .unwrap();
    fx.remote.serve_param_hash("0000");

    let err = fx.repo.checkout(&mut fx.remote, "exp", false).unwrap_err();
    match err {
        RepoError::Integrity(e) => {
            assert_eq!(e.expected, "0000");
            assert_ne!(e.actual, "0000");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.repo.head().unwrap().current_branch, "main");
}

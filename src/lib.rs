//! Version control for machine-learning model weights.
//!
//! `flair` keeps the history of a model's parameters the way Git keeps the
//! history of source files, with two twists: every commit carries a
//! zero-knowledge proof bundle for the model it records, and history is stored
//! as a mix of full checkpoints and element-wise deltas so that a long
//! fine-tuning run does not cost a full copy of the weights per commit.
//!
//! The crate is organised around a local [`repo::Repository`] that mirrors a
//! repository on a remote ledger:
//!
//! - [`tensor`] and [`delta`] hold the tensor model and the delta algebra.
//! - [`repo::store`] persists commits and enforces the draft lifecycle.
//! - [`repo::reconstruct`] replays checkpoint and delta chains.
//! - [`repo::gc`] prunes full params and old pushed commits.
//! - [`repo::push`] uploads local history through the remote's
//!   commit-creation transaction.
//! - [`repo::cache`] switches branches through a bounded per-branch cache.
//! - [`remote`] defines the ledger interface with an HTTP and an in-memory
//!   implementation.
//!
//! Weight extraction ([`extract`]) and proof generation ([`proof`]) sit
//! behind traits so both can be replaced.

pub mod config;
pub mod delta;
pub mod error;
pub mod extract;
pub mod proof;
pub mod remote;
pub mod repo;
pub mod tensor;

pub use config::Config;
pub use error::RepoError;
pub use repo::Repository;

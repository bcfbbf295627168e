//! The `flair` command-line interface.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flair::config::{Config, ENV_API_BASE, ENV_TOKEN};
use flair::extract::SafetensorsExtractor;
use flair::proof::HttpProofService;
use flair::remote::http::HttpRemote;
use flair::repo::cache::CheckoutSource;
use flair::repo::commit::{Commit, CommitHash};
use flair::repo::Repository;
use flair::tensor;

/// Version control for model weights.
#[derive(Debug, Parser)]
#[command(name = "flair")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// API server URL, overrides the config file.
    #[arg(long, env = ENV_API_BASE)]
    api_url: Option<String>,

    /// API authentication token.
    #[arg(long, env = ENV_TOKEN, hide_env_values = true)]
    api_token: Option<String>,

    /// Alternative config file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create `.flair` for an existing remote repository.
    Init { repo_hash: String },
    /// Start a new draft commit.
    Add,
    /// Weight extraction.
    Params {
        #[command(subcommand)]
        command: ParamsCommand,
    },
    /// Proof generation.
    Zkp {
        #[command(subcommand)]
        command: ZkpCommand,
    },
    /// Finalize the current draft.
    Commit {
        #[arg(short, long)]
        message: String,
    },
    /// Upload unpushed commits.
    Push(PushArgs),
    /// Switch to another branch.
    Checkout {
        branch: String,
        /// Always download the branch head, ignoring its cache slot.
        #[arg(long)]
        no_cache: bool,
    },
    /// List, create or delete branches.
    Branch {
        name: Option<String>,
        #[arg(short, long, value_name = "NAME", conflicts_with = "name")]
        delete: Option<String>,
    },
    /// Write the full params of a commit to a file.
    Reconstruct {
        commit: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Show local history.
    Log,
    /// Show HEAD, the draft and unpushed commits.
    Status,
}

#[derive(Debug, Subcommand)]
enum ParamsCommand {
    /// Extract params from a model file into the draft.
    Create {
        #[arg(long)]
        model: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
enum ZkpCommand {
    /// Prove a model and attach the proof to the draft.
    Create {
        #[arg(long)]
        model: PathBuf,
        /// Input dimensions as a JSON array.
        #[arg(long, default_value = "[1, 3, 224, 224]")]
        input_dims: String,
        #[arg(long, default_value = "pytorch")]
        backend: String,
    },
}

#[derive(Debug, Args)]
struct PushArgs {
    branch: Option<String>,
    /// `-u origin <branch>`: push to and track `<branch>`.
    #[arg(short = 'u', long = "set-upstream", num_args = 2, value_names = ["REMOTE", "BRANCH"])]
    upstream: Option<Vec<String>>,
}

impl PushArgs {
    fn target(&self) -> Result<Option<&str>> {
        match self.upstream.as_deref() {
            Some([remote, branch]) => {
                if remote != "origin" {
                    bail!("unknown remote '{remote}', only 'origin' is supported");
                }
                Ok(Some(branch.as_str()))
            }
            Some(_) => bail!("-u expects a remote and a branch"),
            None => Ok(self.branch.as_deref()),
        }
    }
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = Config::from_file(path)?;
                config.apply_env(|key| std::env::var(key).ok());
                config
            }
            None => Config::load()?,
        };
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(token) = &self.api_token {
            config.auth_token = Some(token.clone());
        }
        Ok(config)
    }
}

fn open(config: Config) -> Result<(Repository, HttpRemote)> {
    let cwd = std::env::current_dir().context("reading current directory")?;
    let repo = Repository::discover(&cwd, config)?;
    let info = repo.info()?;
    let remote = HttpRemote::new(repo.config(), info.hash)?;
    Ok((repo, remote))
}

fn describe(commit: &Commit) -> String {
    let kind = commit
        .commit_type()
        .map_or_else(|| "-".to_string(), |t| t.to_string());
    // hashes are uuids; the first block is enough to tell commits apart
    let short = commit.hash().as_str().split('-').next().unwrap_or_default();
    let message = commit
        .finalized()
        .map(|c| c.message.as_str())
        .unwrap_or("(draft)");
    let remote = commit
        .remote_hash()
        .map(|h| format!(" -> {h}"))
        .unwrap_or_default();
    format!(
        "{short} {:<10} {:<10} [{}] {}{}",
        commit.status(),
        kind,
        commit.branch(),
        message,
        remote
    )
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.config()?;
    match cli.command {
        Commands::Init { repo_hash } => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            let mut remote = HttpRemote::new(&config, repo_hash)?;
            let repo = Repository::init_from_remote(&cwd, &mut remote, config)?;
            let head = repo.head()?;
            println!(
                "Initialized {} on branch {}",
                repo.dir().display(),
                head.current_branch
            );
        }
        Commands::Add => {
            let (mut repo, _) = open(config)?;
            let hash = repo.add()?;
            println!("Started draft {hash}");
        }
        Commands::Params {
            command: ParamsCommand::Create { model },
        } => {
            let (mut repo, _) = open(config)?;
            let params = repo.create_params(&SafetensorsExtractor, &model)?;
            println!("Attached params {} ({})", params.hash, params.framework);
        }
        Commands::Zkp {
            command:
                ZkpCommand::Create {
                    model,
                    input_dims,
                    backend,
                },
        } => {
            let dims: Vec<usize> = serde_json::from_str(&input_dims)
                .with_context(|| format!("invalid JSON for --input-dims: {input_dims}"))?;
            let (mut repo, _) = open(config)?;
            let prover = HttpProofService::new(repo.config())?;
            let zkp = repo.create_proof(&prover, &model, &dims, &backend)?;
            println!("Attached proof {}", zkp.proof_cid.as_deref().unwrap_or("-"));
        }
        Commands::Commit { message } => {
            let (mut repo, _) = open(config)?;
            let commit_type = repo.commit(&message)?;
            println!("Committed as {commit_type}");
        }
        Commands::Push(args) => {
            let target = args.target()?;
            let (mut repo, mut remote) = open(config)?;
            let report = repo.push(&mut remote, target)?;
            if report.pushed.is_empty() {
                println!("Everything up-to-date on {}", report.branch.name);
            }
            for (local, remote_hash) in &report.pushed {
                println!("{local} -> {remote_hash}");
            }
            if let Some(hash) = &report.halted_at {
                println!("Stopped at incomplete commit {hash}");
            }
            if !report.pruned.is_empty() {
                println!("Pruned {} old commits", report.pruned.len());
            }
        }
        Commands::Checkout { branch, no_cache } => {
            let (mut repo, mut remote) = open(config)?;
            let checkout = repo.checkout(&mut remote, &branch, no_cache)?;
            let from = match checkout.source {
                CheckoutSource::Cache => "cache",
                CheckoutSource::Remote => "remote",
                CheckoutSource::Empty => "empty branch",
            };
            println!("Switched to {branch} ({from})");
            if !checkout.evicted.is_empty() {
                println!("Evicted {}", checkout.evicted.iter().join(", "));
            }
        }
        Commands::Branch { name, delete } => {
            let (repo, mut remote) = open(config)?;
            match (name, delete) {
                (_, Some(name)) => {
                    repo.delete_branch(&mut remote, &name)?;
                    println!("Deleted branch {name}");
                }
                (Some(name), None) => {
                    let branch = repo.create_branch(&mut remote, &name)?;
                    println!("Created branch {} ({})", branch.name, branch.branch_hash);
                }
                (None, None) => {
                    let current = repo.head()?.current_branch;
                    let branches = repo.refresh_branches(&mut remote)?;
                    for branch in branches.iter().sorted_by(|a, b| a.name.cmp(&b.name)) {
                        let marker = if branch.name == current { '*' } else { ' ' };
                        println!("{marker} {}", branch.name);
                    }
                }
            }
        }
        Commands::Reconstruct { commit, out } => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            let repo = Repository::discover(&cwd, config)?;
            let tensors = repo.reconstruct(&CommitHash::new(commit))?;
            write_params(&out, &tensors)?;
            println!("Wrote {} tensors to {}", tensors.len(), out.display());
        }
        Commands::Log => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            let repo = Repository::discover(&cwd, config)?;
            for commit in repo.log()?.iter().rev() {
                println!("{}", describe(commit));
            }
        }
        Commands::Status => {
            let cwd = std::env::current_dir().context("reading current directory")?;
            let repo = Repository::discover(&cwd, config)?;
            let status = repo.status()?;
            println!("On branch {}", status.head.current_branch);
            println!("Last pushed: {}", status.head.previous_commit);
            match &status.draft {
                Some(draft) => println!(
                    "Draft {}: params {}, proof {}",
                    draft.hash,
                    if draft.params.is_some() { "attached" } else { "missing" },
                    if draft.zkp.is_some() { "attached" } else { "missing" },
                ),
                None => println!("No draft in progress"),
            }
            println!("{} commits not pushed", status.unpushed);
        }
    }
    Ok(())
}

fn write_params(out: &Path, tensors: &tensor::TensorMap) -> Result<()> {
    tensor::save(out, tensors).with_context(|| format!("writing {}", out.display()))
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

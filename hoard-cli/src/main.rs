//! Hoard - content-addressed storage for files and directories
//!
//! Thin command line front end over `hoard-core`. Objects live in
//! `<dir>/cache`, the checksum state in `<dir>/tmp/state.db`.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hoard_core::checkout::Prompt;
use hoard_core::config::{Config, cache_dir, state_db_path};
use hoard_core::hash::hash_file;
use hoard_core::ignore::GlobIgnore;
use hoard_core::tree::{key_to_relpath, relpath_to_key};
use hoard_core::{
    BuildOptions, CheckoutOptions, FileSystem, HashInfo, Ignore, LocalFileSystem, Object, ObjectDb,
    OdbOptions, SqliteState, StateCache, StateNoop, TransferOptions, Tree,
};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hoard")]
#[command(author = "Hoard Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Content-addressed storage for files and directories", long_about = None)]
struct Cli {
    /// Hoard directory holding the config, cache and state
    #[arg(long, global = true, default_value = ".hoard")]
    dir: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config and create the cache
    Init,

    /// Hash a file or directory and store it in the cache
    Build {
        path: PathBuf,

        /// Only print the hash
        #[arg(long)]
        dry_run: bool,
    },

    /// Materialize an object into a workspace path
    Checkout {
        oid: String,
        path: PathBuf,

        /// Remove modified workspace data without asking
        #[arg(short, long)]
        force: bool,

        /// Re-link unchanged files using the configured link types
        #[arg(long)]
        relink: bool,

        /// Delete files left by earlier checkouts of other paths
        #[arg(long)]
        prune: bool,
    },

    /// Copy objects into another object database
    Transfer {
        /// Destination object database directory
        #[arg(long)]
        to: PathBuf,

        oids: Vec<String>,

        /// Do not follow trees into their entries
        #[arg(long)]
        shallow: bool,

        /// Allow hardlinks into the destination
        #[arg(long)]
        hardlink: bool,

        /// Re-hash objects after copying
        #[arg(long)]
        verify: bool,
    },

    /// Print the hash of a file
    Hash {
        path: PathBuf,

        /// Algorithm (md5, md5-dos2unix, sha256, blake3)
        #[arg(long)]
        algorithm: Option<String>,
    },

    /// List the names in a tree object
    Ls {
        oid: String,

        /// Path inside the tree
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Compare two objects
    Diff { old: String, new: String },

    /// Disk usage of a tree object
    Du { oid: String },

    /// Remove objects not reachable from the given ones
    Gc {
        used: Vec<String>,

        /// Keep only the listed objects, not the entries of listed trees
        #[arg(long)]
        shallow: bool,

        /// Only report what would be removed
        #[arg(long)]
        dry: bool,
    },

    /// Verify stored objects
    Check { oids: Vec<String> },
}

/// Cache, state and config of one hoard directory
struct Repo {
    config: Config,
    state: Arc<dyn StateCache>,
    odb: ObjectDb,
}

impl Repo {
    fn open(dir: &Path) -> Result<Self> {
        let config = Config::load(dir).with_context(|| format!("failed to load config from '{}'", dir.display()))?;
        let state: Arc<dyn StateCache> = if config.state {
            let root = std::env::current_dir().context("failed to get current directory")?;
            Arc::new(SqliteState::open(root, &state_db_path(dir)).context("failed to open state database")?)
        } else {
            Arc::new(StateNoop)
        };
        let odb = ObjectDb::local(cache_dir(dir), Self::odb_options(&config, state.clone()));
        Ok(Self { config, state, odb })
    }

    fn odb_options(config: &Config, state: Arc<dyn StateCache>) -> OdbOptions {
        OdbOptions {
            read_only: false,
            verify: config.cache.verify,
            shared: config.cache.shared,
            hash_name: config.cache.hash.clone(),
            cache_types: config.cache.link_types.clone(),
            jobs: config.jobs(),
            state,
        }
    }

    /// Resolve a possibly shortened oid against the cache
    async fn resolve(&self, oid: &str) -> Result<HashInfo> {
        let full = if self.odb.exists(oid).await {
            oid.to_string()
        } else {
            self.odb
                .exists_prefix(oid)
                .await
                .with_context(|| format!("unknown object '{}'", oid))?
        };
        Ok(HashInfo::new(self.odb.hash_name(), full))
    }

    async fn load(&self, oid: &str) -> Result<Object> {
        let hash_info = self.resolve(oid).await?;
        if hash_info.is_dir() {
            let tree = Tree::load(&self.odb, &hash_info)
                .await
                .with_context(|| format!("failed to load tree '{}'", oid))?;
            Ok(Object::Tree(tree))
        } else {
            Ok(Object::Blob(self.odb.get(hash_info.value.as_deref().unwrap_or_default())))
        }
    }
}

fn confirm(msg: &str) -> bool {
    print!("{} [y/N] ", msg);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match std::io::stdin().lock().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
        Err(_) => false,
    }
}

async fn workspace_ignore(path: &Path) -> Result<Option<Arc<dyn Ignore>>> {
    let root = if path.is_dir() { path } else { path.parent().unwrap_or(path) };
    let ignore = GlobIgnore::load(root)
        .await
        .with_context(|| format!("failed to read ignore rules in '{}'", root.display()))?;
    Ok(ignore.map(|ignore| Arc::new(ignore) as Arc<dyn Ignore>))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    if let Commands::Init = cli.command {
        let config = Config::load(&cli.dir)?;
        config.save(&cli.dir).context("failed to write config")?;
        std::fs::create_dir_all(cache_dir(&cli.dir))?;
        info!("initialized hoard directory '{}'", cli.dir.display());
        return Ok(());
    }

    let repo = Repo::open(&cli.dir)?;
    let fs: Arc<dyn FileSystem> = LocalFileSystem::shared();

    match cli.command {
        Commands::Init => {}

        Commands::Build { path, dry_run } => {
            let options = BuildOptions {
                dry_run,
                ignore: workspace_ignore(&path).await?,
                checksum_jobs: Some(repo.config.checksum_jobs()),
                ..Default::default()
            };
            let name = repo.config.cache.hash.clone();
            let built = hoard_core::build(&repo.odb, &path, fs.clone(), &name, &options)
                .await
                .with_context(|| format!("failed to build '{}'", path.display()))?;
            let hash_info = built.object.hash_info().cloned().context("build produced no hash")?;

            if !dry_run {
                let result = hoard_core::transfer(
                    &built.staging,
                    &repo.odb,
                    std::slice::from_ref(&hash_info),
                    TransferOptions {
                        jobs: Some(repo.config.jobs()),
                        ..Default::default()
                    },
                )
                .await?;
                if !result.is_success() {
                    bail!("failed to store {} object(s)", result.failed.len());
                }
                info!("stored {} new object(s)", result.transferred.len());
            }
            println!("{}", hash_info.value.unwrap_or_default());
        }

        Commands::Checkout {
            oid,
            path,
            force,
            relink,
            prune,
        } => {
            let obj = repo.load(&oid).await?;
            let prompt: Prompt<'_> = &confirm;
            let options = CheckoutOptions {
                force,
                relink,
                ignore: workspace_ignore(&path).await?,
                state: Some(repo.state.clone()),
                prompt: Some(prompt),
                ..Default::default()
            };
            let changed = hoard_core::checkout(&path, fs.clone(), Some(&obj), &repo.odb, options)
                .await
                .with_context(|| format!("failed to check out '{}'", path.display()))?;
            if !changed {
                info!("'{}' is up to date", path.display());
            }

            if prune {
                let unused = repo.state.get_unused_links(&[path.clone()], fs.as_ref())?;
                for link in &unused {
                    warn!("removing stale checkout '{}'", link.display());
                }
                repo.state.remove_links(&unused, fs.as_ref())?;
            }
        }

        Commands::Transfer {
            to,
            oids,
            shallow,
            hardlink,
            verify,
        } => {
            let dest = ObjectDb::local(&to, Repo::odb_options(&repo.config, Arc::new(StateNoop)));
            let mut hash_infos = Vec::with_capacity(oids.len());
            for oid in &oids {
                hash_infos.push(repo.resolve(oid).await?);
            }
            let result = hoard_core::transfer(
                &repo.odb,
                &dest,
                &hash_infos,
                TransferOptions {
                    jobs: Some(repo.config.jobs()),
                    verify,
                    hardlink,
                    shallow,
                },
            )
            .await?;
            println!("{} transferred, {} failed", result.transferred.len(), result.failed.len());
            for hash_info in &result.failed {
                println!("failed: {}", hash_info.value.as_deref().unwrap_or_default());
            }
            if !result.is_success() {
                bail!("transfer to '{}' was incomplete", to.display());
            }
        }

        Commands::Hash { path, algorithm } => {
            let name = algorithm.unwrap_or_else(|| repo.config.cache.hash.clone());
            let (meta, hash_info) = hash_file(&path, fs.as_ref(), &name, Some(repo.state.as_ref()), None)
                .await
                .with_context(|| format!("failed to hash '{}'", path.display()))?;
            println!(
                "{}  {}  {}",
                hash_info.value.unwrap_or_default(),
                meta.size.unwrap_or_default(),
                path.display()
            );
        }

        Commands::Ls { oid, prefix } => {
            let obj = repo.load(&oid).await?;
            let Some(tree) = obj.as_tree() else {
                bail!("'{}' is not a tree", oid);
            };
            let key = if prefix.is_empty() { Vec::new() } else { relpath_to_key(&prefix) };
            for name in tree.ls(&key)? {
                println!("{}", name);
            }
        }

        Commands::Diff { old, new } => {
            let old = repo.load(&old).await?;
            let new = repo.load(&new).await?;
            let result = hoard_core::diff(Some(&old), Some(&new), &repo.odb).await?;
            for (label, changes) in [("added", &result.added), ("modified", &result.modified), ("deleted", &result.deleted)]
            {
                for change in changes {
                    println!("{}: {}", label, key_to_relpath(change.key()));
                }
            }
            for (label, count) in result.stats() {
                info!("{}: {}", label, count);
            }
        }

        Commands::Du { oid } => {
            let obj = repo.load(&oid).await?;
            let size = match &obj {
                Object::Tree(tree) => hoard_core::du(&repo.odb, tree).await,
                Object::Blob(file) => file.fs.info(&file.path).await.ok().map(|info| info.size),
            };
            match size {
                Some(size) => println!("{}", size),
                None => bail!("'{}' is not fully present in the cache", oid),
            }
        }

        Commands::Gc { used, shallow, dry } => {
            let mut hash_infos = Vec::with_capacity(used.len());
            for oid in &used {
                hash_infos.push(repo.resolve(oid).await?);
            }
            let removed = hoard_core::gc(&repo.odb, &hash_infos, shallow, dry, None).await?;
            if dry {
                println!("would remove {} object(s)", removed);
            } else {
                println!("removed {} object(s)", removed);
            }
        }

        Commands::Check { oids } => {
            let oids = if oids.is_empty() { repo.odb.all().await? } else { oids };
            let mut bad = 0;
            for oid in &oids {
                if let Err(e) = repo.odb.check(oid, true).await {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    warn!("{}: {}", oid, e);
                    bad += 1;
                }
            }
            if bad > 0 {
                bail!("{} of {} object(s) failed verification", bad, oids.len());
            }
            println!("{} object(s) ok", oids.len());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checkout() {
        let cli = Cli::try_parse_from(["hoard", "--dir", "/tmp/h", "checkout", "abc.dir", "out", "--force"]).unwrap();
        assert_eq!(cli.dir, PathBuf::from("/tmp/h"));
        match cli.command {
            Commands::Checkout { oid, path, force, relink, prune } => {
                assert_eq!(oid, "abc.dir");
                assert_eq!(path, PathBuf::from("out"));
                assert!(force && !relink && !prune);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_transfer_requires_destination() {
        assert!(Cli::try_parse_from(["hoard", "transfer", "abc"]).is_err());
        let cli = Cli::try_parse_from(["hoard", "transfer", "--to", "remote", "a", "b", "--shallow"]).unwrap();
        match cli.command {
            Commands::Transfer { to, oids, shallow, .. } => {
                assert_eq!(to, PathBuf::from("remote"));
                assert_eq!(oids, vec!["a", "b"]);
                assert!(shallow);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_ls_prefix_defaults_to_root() {
        let cli = Cli::try_parse_from(["hoard", "ls", "abc.dir"]).unwrap();
        assert!(matches!(cli.command, Commands::Ls { prefix, .. } if prefix.is_empty()));
        assert!(!cli.debug);
    }
}

use crate::GitError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Tag namespace holding snapshot commits.
pub const SNAPSHOT_TAG_PREFIX: &str = "corral/snapshots/";

/// Subprocess plumbing over one repository clone.
///
/// All commands run with `-C`, so the manager never changes its own working
/// directory. Commits are made with a fixed identity and signing disabled so
/// they succeed regardless of the host's git configuration.
#[derive(Debug, Clone)]
pub struct GitWorktreeManager {
    repo: PathBuf,
    binary: String,
}

impl GitWorktreeManager {
    pub fn new(repo: impl Into<PathBuf>, binary: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            binary: binary.into(),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        debug!("git -C {} {}", dir.display(), args.join(" "));
        let output = Command::new(&self.binary)
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "user.name=corral",
                "-c",
                "user.email=corral@localhost",
                "-c",
                "commit.gpgsign=false",
                "-c",
                "tag.gpgsign=false",
            ])
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| GitError::Launch {
                binary: self.binary.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
        } else {
            Err(GitError::Failed {
                command: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            })
        }
    }

    /// Fail unless the configured path is inside a git repository.
    pub async fn verify_repository(&self) -> Result<(), GitError> {
        self.run(&self.repo, &["rev-parse", "--git-dir"]).await?;
        Ok(())
    }

    /// Resolve a ref to a full commit id.
    pub async fn resolve(&self, reference: &str) -> Result<String, GitError> {
        self.run(
            &self.repo,
            &["rev-parse", "--verify", &format!("{reference}^{{commit}}")],
        )
        .await
    }

    /// Create a worktree at `path` on a new branch starting from `start`.
    pub async fn add_worktree(&self, path: &Path, branch: &str, start: &str) -> Result<(), GitError> {
        let path = path.to_string_lossy();
        self.run(&self.repo, &["worktree", "add", "-b", branch, &path, start])
            .await?;
        Ok(())
    }

    /// Remove a worktree. A worktree whose directory is already gone is pruned
    /// instead, so partially cleaned-up runtimes can still be terminated.
    pub async fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        if path.exists() {
            let path_str = path.to_string_lossy();
            if let Err(e) = self
                .run(&self.repo, &["worktree", "remove", "--force", &path_str])
                .await
            {
                if path.exists() {
                    return Err(e);
                }
                debug!("worktree {path_str} vanished during removal");
            }
        }
        self.run(&self.repo, &["worktree", "prune"]).await?;
        Ok(())
    }

    pub async fn branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let reference = format!("refs/heads/{branch}");
        match self
            .run(&self.repo, &["show-ref", "--verify", "--quiet", &reference])
            .await
        {
            Ok(_) => Ok(true),
            Err(GitError::Failed { code: Some(1), .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Force-delete a branch. Deleting a missing branch succeeds.
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        if !self.branch_exists(branch).await? {
            return Ok(());
        }
        self.run(&self.repo, &["branch", "-D", branch]).await?;
        Ok(())
    }

    /// Stage everything in `worktree` and commit it, returning the new commit.
    /// The commit is created even when nothing changed.
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<String, GitError> {
        self.run(worktree, &["add", "-A"]).await?;
        self.run(
            worktree,
            &["commit", "--allow-empty", "--no-verify", "-q", "-m", message],
        )
        .await?;
        self.run(worktree, &["rev-parse", "HEAD"]).await
    }

    pub async fn create_tag(&self, tag: &str, commit: &str) -> Result<(), GitError> {
        self.run(&self.repo, &["tag", tag, commit]).await?;
        Ok(())
    }

    pub async fn delete_tag(&self, tag: &str) -> Result<(), GitError> {
        let reference = format!("refs/tags/{tag}");
        match self
            .run(&self.repo, &["show-ref", "--verify", "--quiet", &reference])
            .await
        {
            Ok(_) => {}
            Err(GitError::Failed { code: Some(1), .. }) => {
                warn!("snapshot tag {tag} already removed");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.run(&self.repo, &["tag", "-d", tag]).await?;
        Ok(())
    }
}

/// Whether a usable git binary is on `PATH`.
pub async fn git_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .output()
        .await
        .is_ok_and(|o| o.status.success())
}

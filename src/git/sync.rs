//! libgit2-backed implementation of [`GitSync`].

use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Direction, Remote, Repository};
use tracing::{debug, info};

use super::auth;
use super::GitSync;
use crate::error::{Error, Result};
use crate::models::GitAuth;

/// The real Git synchronizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitSynchronizer;

impl GitSynchronizer {
    pub fn new() -> Self {
        Self
    }

    fn open(dir: &Path) -> Result<Repository> {
        Repository::open(dir).map_err(|e| Error::git("open", &e))
    }

    fn fetch_branch(
        repo: &Repository,
        branch: &str,
        auth_material: Option<&GitAuth>,
    ) -> Result<()> {
        let mut remote = repo
            .find_remote("origin")
            .map_err(|e| Error::git("fetch", &e))?;
        let refspec = tracking_refspec(branch);
        let mut options = auth::fetch_options(auth_material.cloned());
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|e| Error::git("fetch", &e))?;
        Ok(())
    }
}

fn tracking_refspec(branch: &str) -> String {
    format!("+refs/heads/{branch}:refs/remotes/origin/{branch}")
}

fn tracking_ref(branch: &str) -> String {
    format!("refs/remotes/origin/{branch}")
}

impl GitSync for GitSynchronizer {
    fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        auth_material: Option<&GitAuth>,
        dest: &Path,
    ) -> Result<String> {
        let branch = if branch.is_empty() {
            self.default_branch(url, auth_material)?
        } else {
            branch.to_string()
        };

        info!(url, branch = %branch, dest = %dest.display(), "cloning repository");

        let options = auth::fetch_options(auth_material.cloned());
        let refspec = tracking_refspec(&branch);
        let mut builder = RepoBuilder::new();
        builder
            .fetch_options(options)
            .branch(&branch)
            // Single-branch: the remote is created with one fetch refspec so
            // only the tracked branch is ever transferred.
            .remote_create(move |repo, name, url| repo.remote_with_fetch(name, url, &refspec));

        builder
            .clone(url, dest)
            .map_err(|e| Error::git("clone", &e))?;

        Ok(branch)
    }

    fn pull(&self, branch: &str, auth_material: Option<&GitAuth>, dir: &Path) -> Result<String> {
        let repo = Self::open(dir)?;
        Self::fetch_branch(&repo, branch, auth_material)?;

        let remote_ref = repo
            .find_reference(&tracking_ref(branch))
            .map_err(|e| Error::git("pull", &e))?;
        let target = repo
            .reference_to_annotated_commit(&remote_ref)
            .map_err(|e| Error::git("pull", &e))?;

        let (analysis, _) = repo
            .merge_analysis(&[&target])
            .map_err(|e| Error::git("pull", &e))?;

        if analysis.is_up_to_date() {
            debug!(branch, "already up to date");
            return self.latest_commit(dir);
        }

        if !analysis.is_fast_forward() {
            return Err(Error::Git {
                op: "pull",
                message: format!(
                    "local '{branch}' has diverged from the remote; refusing a non-fast-forward merge"
                ),
                auth_failure: false,
            });
        }

        let refname = format!("refs/heads/{branch}");
        match repo.find_reference(&refname) {
            Ok(mut local) => {
                local
                    .set_target(target.id(), "dockhand: fast-forward")
                    .map_err(|e| Error::git("pull", &e))?;
            }
            Err(_) => {
                repo.reference(&refname, target.id(), true, "dockhand: create branch")
                    .map_err(|e| Error::git("pull", &e))?;
            }
        }
        repo.set_head(&refname).map_err(|e| Error::git("pull", &e))?;
        repo.checkout_head(Some(CheckoutBuilder::default().force()))
            .map_err(|e| Error::git("pull", &e))?;

        info!(branch, commit = %target.id(), "fast-forwarded");
        Ok(target.id().to_string())
    }

    fn fetch(&self, branch: &str, auth_material: Option<&GitAuth>, dir: &Path) -> Result<()> {
        let repo = Self::open(dir)?;
        Self::fetch_branch(&repo, branch, auth_material)
    }

    fn latest_commit(&self, dir: &Path) -> Result<String> {
        let repo = Self::open(dir)?;
        let head = repo.head().map_err(|e| Error::git("resolve HEAD", &e))?;
        let commit = head
            .peel_to_commit()
            .map_err(|e| Error::git("resolve HEAD", &e))?;
        Ok(commit.id().to_string())
    }

    fn remote_latest_commit(&self, dir: &Path, branch: &str) -> Result<String> {
        let repo = Self::open(dir)?;
        let reference = repo
            .find_reference(&tracking_ref(branch))
            .map_err(|e| Error::git("resolve remote branch", &e))?;
        let commit = reference
            .peel_to_commit()
            .map_err(|e| Error::git("resolve remote branch", &e))?;
        Ok(commit.id().to_string())
    }

    fn default_branch(&self, url: &str, auth_material: Option<&GitAuth>) -> Result<String> {
        let mut remote =
            Remote::create_detached(url).map_err(|e| Error::git("resolve default branch", &e))?;
        let callbacks = auth::remote_callbacks(auth_material.cloned());
        let connection = remote
            .connect_auth(Direction::Fetch, Some(callbacks), None)
            .map_err(|e| Error::git("resolve default branch", &e))?;
        let buf = connection
            .default_branch()
            .map_err(|e| Error::git("resolve default branch", &e))?;

        let full = buf.as_str().ok_or_else(|| Error::Git {
            op: "resolve default branch",
            message: "remote HEAD is not valid utf-8".into(),
            auth_failure: false,
        })?;

        Ok(full
            .strip_prefix("refs/heads/")
            .unwrap_or(full)
            .to_string())
    }

    fn test_auth(&self, url: &str, auth_material: Option<&GitAuth>) -> Result<()> {
        // A detached remote never writes refs or credential caches; the
        // listing is the cheapest authenticated round-trip Git offers.
        let mut remote = Remote::create_detached(url).map_err(|e| Error::git("ls-remote", &e))?;
        let callbacks = auth::remote_callbacks(auth_material.cloned());
        let connection = remote
            .connect_auth(Direction::Fetch, Some(callbacks), None)
            .map_err(|e| Error::git("ls-remote", &e))?;
        connection.list().map_err(|e| Error::git("ls-remote", &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::TempDir;

    fn init_upstream(dir: &Path) -> Repository {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        Repository::init_opts(dir, &opts).unwrap()
    }

    fn commit_file(repo: &Repository, name: &str, content: &str) -> String {
        std::fs::write(repo.workdir().unwrap().join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(name)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("tester", "tester@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<_> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, "update", &tree, &parents)
            .unwrap()
            .to_string()
    }

    struct Fixture {
        _dir: TempDir,
        upstream: Repository,
        upstream_path: String,
        checkout: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let upstream_path = dir.path().join("upstream");
        let upstream = init_upstream(&upstream_path);
        commit_file(&upstream, "compose.yml", "services: {}\n");
        Fixture {
            upstream_path: upstream_path.to_string_lossy().into_owned(),
            checkout: dir.path().join("checkout"),
            upstream,
            _dir: dir,
        }
    }

    #[test]
    fn test_clone_and_latest_commit() {
        let f = fixture();
        let git = GitSynchronizer::new();
        let branch = git
            .clone_repo(&f.upstream_path, "main", None, &f.checkout)
            .unwrap();
        assert_eq!(branch, "main");

        let local = git.latest_commit(&f.checkout).unwrap();
        let upstream_head = f.upstream.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(local, upstream_head.id().to_string());
    }

    #[test]
    fn test_clone_resolves_default_branch_when_empty() {
        let f = fixture();
        let git = GitSynchronizer::new();
        let branch = git
            .clone_repo(&f.upstream_path, "", None, &f.checkout)
            .unwrap();
        assert_eq!(branch, "main");
    }

    #[test]
    fn test_pull_is_idempotent_when_up_to_date() {
        let f = fixture();
        let git = GitSynchronizer::new();
        git.clone_repo(&f.upstream_path, "main", None, &f.checkout)
            .unwrap();

        let before = git.latest_commit(&f.checkout).unwrap();
        let after = git.pull("main", None, &f.checkout).unwrap();
        assert_eq!(before, after);
        // And again, for good measure.
        assert_eq!(git.pull("main", None, &f.checkout).unwrap(), before);
    }

    #[test]
    fn test_pull_fast_forwards_to_upstream() {
        let f = fixture();
        let git = GitSynchronizer::new();
        git.clone_repo(&f.upstream_path, "main", None, &f.checkout)
            .unwrap();

        let new_commit = commit_file(&f.upstream, "compose.yml", "services:\n  web: {}\n");
        let pulled = git.pull("main", None, &f.checkout).unwrap();
        assert_eq!(pulled, new_commit);
        assert_eq!(git.latest_commit(&f.checkout).unwrap(), new_commit);

        let contents =
            std::fs::read_to_string(f.checkout.join("compose.yml")).unwrap();
        assert!(contents.contains("web"));
    }

    #[test]
    fn test_fetch_updates_tracking_ref_without_touching_worktree() {
        let f = fixture();
        let git = GitSynchronizer::new();
        git.clone_repo(&f.upstream_path, "main", None, &f.checkout)
            .unwrap();
        let old_local = git.latest_commit(&f.checkout).unwrap();

        let new_commit = commit_file(&f.upstream, "compose.yml", "services:\n  api: {}\n");
        git.fetch("main", None, &f.checkout).unwrap();

        assert_eq!(
            git.remote_latest_commit(&f.checkout, "main").unwrap(),
            new_commit
        );
        // Working tree still at the old commit.
        assert_eq!(git.latest_commit(&f.checkout).unwrap(), old_local);
        let contents =
            std::fs::read_to_string(f.checkout.join("compose.yml")).unwrap();
        assert!(!contents.contains("api"));
    }

    #[test]
    fn test_test_auth_lists_public_remote() {
        let f = fixture();
        let git = GitSynchronizer::new();
        git.test_auth(&f.upstream_path, None).unwrap();
    }

    #[test]
    fn test_missing_remote_is_a_git_error() {
        let dir = TempDir::new().unwrap();
        let git = GitSynchronizer::new();
        let err = git
            .clone_repo(
                dir.path().join("nope").to_str().unwrap(),
                "main",
                None,
                &dir.path().join("dest"),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Git { .. }));
    }
}

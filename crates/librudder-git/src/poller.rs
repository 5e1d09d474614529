//! Git poller backed by local bare mirrors
//!
//! Each repository URL gets one bare mirror under `<cache_dir>/repos/`.
//! A poll fetches branches and tags into the mirror, resolves the target
//! revision to a commit and reads the file tree below the source path.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use git2::{FetchOptions, FetchPrune, ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};
use librudder_core::types::{ApplicationSource, SourceTree};
use tracing::debug;

use crate::GitError;

/// Refspecs fetched into every mirror
pub const MIRROR_REFSPECS: [&str; 2] = ["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Git file mode for symbolic links
const SYMLINK_MODE: i32 = 0o120000;

/// Fetches sources into a mirror cache and reads trees out of it
pub struct GitPoller {
    cache_dir: PathBuf,
    /// One lock per mirror; libgit2 does not serialize concurrent fetches
    mirror_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitPoller {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            mirror_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Mirror directory for a repository URL
    pub fn mirror_path(&self, url: &str) -> PathBuf {
        let mut hasher = Blake2b::<U16>::new();
        hasher.update(url.as_bytes());
        self.cache_dir
            .join("repos")
            .join(hex::encode(hasher.finalize()))
    }

    /// Fetch `url`, resolve `revision` and read the tree at `path`
    pub fn poll(&self, url: &str, revision: &str, path: &str) -> Result<SourceTree, GitError> {
        let mirror_path = self.mirror_path(url);
        let lock = self.mirror_lock(&mirror_path);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let repo = open_mirror(&mirror_path)?;
        fetch(&repo, url)?;
        let oid = resolve(&repo, url, revision)?;
        let files = read_tree(&repo, oid, path)?;

        debug!(
            url = %url,
            revision = %revision,
            commit = %oid,
            files = files.len(),
            "Polled source"
        );

        Ok(SourceTree {
            commit: oid.to_string(),
            files,
        })
    }

    /// Poll an application source
    pub fn poll_source(&self, source: &ApplicationSource) -> Result<SourceTree, GitError> {
        self.poll(&source.repo_url, &source.target_revision, &source.path)
    }

    fn mirror_lock(&self, mirror_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .mirror_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(mirror_path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Open the bare mirror, creating it on first use
pub fn open_mirror(path: &Path) -> Result<Repository, GitError> {
    if path.join("HEAD").exists() {
        return Ok(Repository::open_bare(path)?);
    }
    std::fs::create_dir_all(path)?;
    Ok(Repository::init_bare(path)?)
}

/// Fetch branches and tags from `url` into the mirror
pub fn fetch(repo: &Repository, url: &str) -> Result<(), GitError> {
    let mut remote = repo
        .remote_anonymous(url)
        .map_err(|e| GitError::from_fetch(url, e))?;

    let mut options = FetchOptions::new();
    options.prune(FetchPrune::On);

    remote
        .fetch(&MIRROR_REFSPECS, Some(&mut options), None)
        .map_err(|e| GitError::from_fetch(url, e))?;

    // Track the remote default branch so "HEAD" means what it means upstream
    if let Ok(default_branch) = remote.default_branch() {
        if let Some(name) = default_branch.as_str() {
            if let Err(e) = repo.set_head(name) {
                debug!(url = %url, error = %e, "Could not update mirror HEAD");
            }
        }
    }
    Ok(())
}

/// Resolve a branch, tag, commit id or `HEAD` to a commit
pub fn resolve(repo: &Repository, url: &str, revision: &str) -> Result<Oid, GitError> {
    if revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(commit) = Oid::from_str(revision).and_then(|oid| repo.find_commit(oid)) {
            return Ok(commit.id());
        }
    }

    let candidates: Vec<String> = if revision == "HEAD" {
        vec![
            "HEAD".to_string(),
            "refs/heads/main".to_string(),
            "refs/heads/master".to_string(),
        ]
    } else {
        vec![
            format!("refs/heads/{}", revision),
            format!("refs/tags/{}", revision),
            revision.to_string(),
        ]
    };

    for spec in &candidates {
        if let Ok(object) = repo.revparse_single(spec) {
            if let Ok(commit) = object.peel_to_commit() {
                return Ok(commit.id());
            }
        }
    }

    Err(GitError::RevisionNotFound {
        url: url.to_string(),
        revision: revision.to_string(),
    })
}

/// Read every regular file below `path` at `commit`.
///
/// Keys are relative to `path` and use `/` separators.
pub fn read_tree(repo: &Repository, commit: Oid, path: &str) -> Result<BTreeMap<String, Vec<u8>>, GitError> {
    let root = repo.find_commit(commit)?.tree()?;
    let relative = path.trim_matches('/');

    let not_found = || GitError::PathNotFound {
        path: path.to_string(),
        commit: commit.to_string(),
    };

    let tree = if relative.is_empty() || relative == "." {
        root
    } else {
        let entry = root.get_path(Path::new(relative)).map_err(|_| not_found())?;
        if entry.kind() != Some(ObjectType::Tree) {
            return Err(not_found());
        }
        repo.find_tree(entry.id())?
    };

    let mut blobs = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |dir, entry| {
        if entry.kind() == Some(ObjectType::Blob) && entry.filemode() != SYMLINK_MODE {
            if let Some(name) = entry.name() {
                blobs.push((format!("{}{}", dir, name), entry.id()));
            }
        }
        TreeWalkResult::Ok
    })?;

    let mut files = BTreeMap::new();
    for (file_path, id) in blobs {
        let blob = repo.find_blob(id)?;
        files.insert(file_path, blob.content().to_vec());
    }
    Ok(files)
}

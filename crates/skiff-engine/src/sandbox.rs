use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use skiff_core::tools::FileMutation;

use crate::diff;
use crate::patch::{self, PatchError};

pub const DEFAULT_TREE_CAP: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid path: {0}")]
    Invalid(String),
    #[error("path is outside the sandbox root: {0}")]
    Outside(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },
    #[error(transparent)]
    Patch(#[from] PatchError),
}

#[derive(Clone, Debug, Serialize)]
pub struct ReadFileOutput {
    pub content: String,
    pub size: u64,
    pub mtime: f64,
    pub truncated: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct TreeEntry {
    pub path: String,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TreeListing {
    pub entries: Vec<TreeEntry>,
    pub truncated: bool,
}

/// Filesystem operations confined under a configured root. Every mutation
/// goes through a per-path lock and an atomic temp-file + rename, and
/// returns a [`FileMutation`] carrying the pre-image and unified diff for
/// version bookkeeping.
pub struct SandboxFs {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    tree_cap: usize,
}

impl SandboxFs {
    /// The root must exist; it is canonicalized once so later symlink checks
    /// compare against the real directory.
    pub fn new(root: &Path) -> Result<Self, SandboxError> {
        let root = root.canonicalize().map_err(|e| SandboxError::Io {
            path: root.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            root,
            locks: DashMap::new(),
            tree_cap: DEFAULT_TREE_CAP,
        })
    }

    pub fn with_tree_cap(mut self, cap: usize) -> Self {
        self.tree_cap = cap;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a user-supplied path to a real location under the root.
    /// Rejects `..` traversal, absolute paths escaping the root, and
    /// symlinks whose target resolves outside the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, SandboxError> {
        if raw.trim().is_empty() {
            return Err(SandboxError::Invalid("path is required".into()));
        }

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::ParentDir => {
                    return Err(SandboxError::Outside(raw.to_string()));
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }

        if !normalized.starts_with(&self.root) {
            return Err(SandboxError::Outside(raw.to_string()));
        }

        // Canonicalize the deepest existing ancestor so a symlink anywhere in
        // the path cannot escape the root.
        let mut existing = normalized.clone();
        let mut tail: Vec<std::ffi::OsString> = Vec::new();
        while std::fs::symlink_metadata(&existing).is_err() {
            let Some(name) = existing.file_name() else {
                return Err(SandboxError::Outside(raw.to_string()));
            };
            tail.push(name.to_os_string());
            existing = match existing.parent() {
                Some(p) => p.to_path_buf(),
                None => return Err(SandboxError::Outside(raw.to_string())),
            };
        }
        let canonical = existing.canonicalize().map_err(|e| SandboxError::Io {
            path: raw.to_string(),
            message: e.to_string(),
        })?;
        if canonical != self.root && !canonical.starts_with(&self.root) {
            return Err(SandboxError::Outside(raw.to_string()));
        }

        let mut resolved = canonical;
        for name in tail.iter().rev() {
            resolved.push(name);
        }
        Ok(resolved)
    }

    /// Root-relative display form used in events, versions, and diffs.
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn lock_for(&self, display_path: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(display_path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn read_file(
        &self,
        raw_path: &str,
        max_bytes: Option<usize>,
    ) -> Result<ReadFileOutput, SandboxError> {
        let path = self.resolve(raw_path)?;
        let display = self.display(&path);

        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| SandboxError::NotFound(display.clone()))?;
        if !meta.is_file() {
            return Err(SandboxError::NotAFile(display));
        }

        let bytes = tokio::fs::read(&path).await.map_err(|e| SandboxError::Io {
            path: display.clone(),
            message: e.to_string(),
        })?;
        let size = bytes.len() as u64;

        let cap = max_bytes.unwrap_or(bytes.len());
        let truncated = bytes.len() > cap;
        let slice = if truncated { &bytes[..cap] } else { &bytes[..] };

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        Ok(ReadFileOutput {
            content: String::from_utf8_lossy(slice).into_owned(),
            size,
            mtime,
            truncated,
        })
    }

    pub async fn write_file(
        &self,
        raw_path: &str,
        content: &str,
    ) -> Result<FileMutation, SandboxError> {
        let path = self.resolve(raw_path)?;
        let display = self.display(&path);
        let lock = self.lock_for(&display);
        let _guard = lock.lock().await;

        let before = read_if_file(&path).await;
        self.write_atomic(&path, &display, content).await?;

        Ok(make_mutation(&display, before, content, "write_file"))
    }

    /// Parse and apply a unified diff. All target files are resolved and
    /// their new contents computed before anything is written, so a
    /// mismatched hunk leaves the tree untouched.
    pub async fn apply_patch(
        &self,
        patch_text: &str,
    ) -> Result<Vec<FileMutation>, SandboxError> {
        let file_patches = patch::parse(patch_text)?;

        let mut staged: Vec<(PathBuf, String, Option<String>, String)> = Vec::new();
        for fp in &file_patches {
            let path = self.resolve(&fp.path)?;
            let display = self.display(&path);
            let before = read_if_file(&path).await;
            if before.is_none() && !fp.is_new {
                return Err(SandboxError::NotFound(display));
            }
            let after = patch::apply(before.as_deref().unwrap_or(""), fp)?;
            staged.push((path, display, before, after));
        }

        let mut mutations = Vec::new();
        for (path, display, before, after) in staged {
            let lock = self.lock_for(&display);
            let _guard = lock.lock().await;
            self.write_atomic(&path, &display, &after).await?;
            mutations.push(make_mutation(&display, before, &after, "apply_patch"));
        }
        Ok(mutations)
    }

    /// Overwrite a file with previously snapshotted content.
    pub async fn restore(
        &self,
        raw_path: &str,
        content: &str,
    ) -> Result<FileMutation, SandboxError> {
        let path = self.resolve(raw_path)?;
        let display = self.display(&path);
        let lock = self.lock_for(&display);
        let _guard = lock.lock().await;

        let before = read_if_file(&path).await;
        self.write_atomic(&path, &display, content).await?;

        Ok(make_mutation(&display, before, content, "rollback"))
    }

    /// Bounded breadth-first listing of files under the root. Hidden
    /// directories and files are skipped.
    pub async fn list_tree(&self) -> Result<TreeListing, SandboxError> {
        let mut entries = Vec::new();
        let mut truncated = false;
        let mut queue = std::collections::VecDeque::from([self.root.clone()]);

        while let Some(dir) = queue.pop_front() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(r) => r,
                Err(e) => {
                    debug!(path = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            let mut children = Vec::new();
            while let Ok(Some(entry)) = reader.next_entry().await {
                children.push(entry);
            }
            children.sort_by_key(|e| e.file_name());

            for entry in children {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with('.') {
                    continue;
                }
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_dir() {
                    queue.push_back(entry.path());
                } else if file_type.is_file() {
                    if entries.len() >= self.tree_cap {
                        truncated = true;
                        queue.clear();
                        break;
                    }
                    let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                    entries.push(TreeEntry {
                        path: self.display(&entry.path()),
                        size,
                    });
                }
            }
        }

        Ok(TreeListing { entries, truncated })
    }

    async fn write_atomic(
        &self,
        path: &Path,
        display: &str,
        content: &str,
    ) -> Result<(), SandboxError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::Io {
                    path: display.to_string(),
                    message: format!("create parent: {e}"),
                })?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let tmp = path.with_file_name(format!(".{file_name}.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| SandboxError::Io {
                path: display.to_string(),
                message: e.to_string(),
            })?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| SandboxError::Io {
                path: display.to_string(),
                message: format!("rename: {e}"),
            })?;
        Ok(())
    }
}

async fn read_if_file(path: &Path) -> Option<String> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    tokio::fs::read(path)
        .await
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn make_mutation(display: &str, before: Option<String>, after: &str, note: &str) -> FileMutation {
    let diff_text = match &before {
        Some(prev) => diff::unified_diff(display, prev, after),
        None => diff::unified_diff_new_file(display, after),
    };
    FileMutation {
        path: display.to_string(),
        before,
        after: after.to_string(),
        diff: diff_text,
        note: note.to_string(),
    }
}

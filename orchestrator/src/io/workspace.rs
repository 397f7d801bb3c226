//! Per-task sandbox directories.
//!
//! Each task gets a full copy of the source tree under
//! `<workspace_root>/<task_id>`. Plan steps mutate only that copy; the source
//! tree is read but never written. Diffs compare the copy back against the
//! source.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};
use walkdir::{DirEntry, WalkDir};

use crate::core::diff::{binary_diff, deletion_diff, looks_binary, unified_diff};
use crate::core::sanitize::sanitize_workspace_path;
use crate::core::types::{FileDiff, PlanStep, StepAction, validate_task_id};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct WorkspaceSandbox {
    source_root: PathBuf,
    workspace_root: PathBuf,
    excluded_dirs: BTreeSet<String>,
}

impl WorkspaceSandbox {
    pub fn new(
        source_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        excluded_dirs: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            workspace_root: workspace_root.into(),
            excluded_dirs: excluded_dirs.into_iter().collect(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Workspace location for `task_id`. Does not touch the filesystem.
    pub fn path(&self, task_id: &str) -> PathBuf {
        self.workspace_root.join(task_id)
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.path(task_id).is_dir()
    }

    /// Replace any previous workspace for `task_id` with a fresh copy of the source tree.
    #[instrument(skip(self))]
    pub fn create(&self, task_id: &str) -> Result<PathBuf> {
        validate_task_id(task_id).map_err(|message| Error::validation("task_id", message))?;
        let dest = self.path(task_id);
        let failed = |source: io::Error| Error::WorkspaceCreateFailed {
            task_id: task_id.to_string(),
            source,
        };

        remove_dir_if_present(&dest).map_err(failed)?;
        fs::create_dir_all(&dest).map_err(failed)?;
        let copied = self.copy_tree(&dest).map_err(failed)?;

        info!(path = %dest.display(), files = copied, "workspace created");
        Ok(dest)
    }

    /// Remove the workspace for `task_id`. A missing workspace is not an error.
    #[instrument(skip(self))]
    pub fn destroy(&self, task_id: &str) -> Result<()> {
        let dest = self.path(task_id);
        remove_dir_if_present(&dest)
            .map_err(|source| Error::io(format!("remove workspace {}", dest.display()), source))?;
        info!(path = %dest.display(), "workspace destroyed");
        Ok(())
    }

    /// Unified diffs for every file that differs between the workspace and the
    /// source tree, sorted by relative path.
    #[instrument(skip(self))]
    pub fn generate_diff(&self, task_id: &str) -> Result<Vec<FileDiff>> {
        let workspace = self.existing_workspace(task_id)?;
        let changed = self.list_files(&workspace)?;
        let original = self.list_files(&self.source_root)?;

        let mut diffs = Vec::new();
        for rel in changed.union(&original) {
            let old = read_optional(&self.source_root.join(rel))?;
            let new = read_optional(&workspace.join(rel))?;
            if let Some(diff) = file_diff(rel, old.as_deref(), new.as_deref()) {
                debug!(path = %rel, "file changed");
                diffs.push(FileDiff {
                    path: rel.clone(),
                    diff,
                });
            }
        }
        info!(files = diffs.len(), "diff generated");
        Ok(diffs)
    }

    /// Apply one plan step inside the workspace of `task_id`.
    ///
    /// Only whole-file actions are supported; `insert` and `replace` need an
    /// editing backend this sandbox does not have.
    #[instrument(skip(self, step, content), fields(file = %step.file, action = %step.action))]
    pub fn apply_step(&self, task_id: &str, step: &PlanStep, content: &str) -> Result<()> {
        let workspace = self.existing_workspace(task_id)?;
        let target = sanitize_workspace_path(&step.file, &workspace)
            .map_err(|message| Error::validation("file", message))?;

        match step.action {
            StepAction::Create => {
                if target.exists() {
                    return Err(Error::io(
                        format!("create {}", step.file),
                        io::Error::new(io::ErrorKind::AlreadyExists, "file already exists"),
                    ));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|source| {
                        Error::io(format!("create directory {}", parent.display()), source)
                    })?;
                }
                fs::write(&target, content)
                    .map_err(|source| Error::io(format!("write {}", step.file), source))?;
            }
            StepAction::Delete => {
                fs::remove_file(&target)
                    .map_err(|source| Error::io(format!("delete {}", step.file), source))?;
            }
            StepAction::Insert | StepAction::Replace => {
                warn!("plan step not supported");
                return Err(Error::UnsupportedStep {
                    action: step.action,
                    file: step.file.clone(),
                });
            }
        }
        debug!("plan step applied");
        Ok(())
    }

    fn existing_workspace(&self, task_id: &str) -> Result<PathBuf> {
        let workspace = self.path(task_id);
        if !workspace.is_dir() {
            return Err(Error::io(
                format!("workspace for task '{task_id}'"),
                io::Error::new(io::ErrorKind::NotFound, "workspace does not exist"),
            ));
        }
        Ok(workspace)
    }

    fn walk<'a>(&'a self, root: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> + 'a {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| self.keep(entry))
    }

    fn keep(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if entry.file_type().is_dir() {
            let name = entry.file_name().to_string_lossy();
            if self.excluded_dirs.contains(name.as_ref()) {
                return false;
            }
            // The workspace root may live inside the source tree.
            if entry.path() == self.workspace_root {
                return false;
            }
        }
        true
    }

    fn copy_tree(&self, dest: &Path) -> io::Result<usize> {
        let mut copied = 0usize;
        for entry in self.walk(&self.source_root) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.depth() == 0 {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.source_root)
                .map_err(io::Error::other)?;
            let target = dest.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)?;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target)?;
                copied += 1;
            }
        }
        Ok(copied)
    }

    /// Regular files under `root` as `/`-separated relative paths.
    fn list_files(&self, root: &Path) -> Result<BTreeSet<String>> {
        let mut files = BTreeSet::new();
        for entry in self.walk(root) {
            let entry = entry.map_err(|err| {
                Error::io(format!("walk {}", root.display()), io::Error::from(err))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(rel);
        }
        Ok(files)
    }
}

fn file_diff(rel: &str, old: Option<&[u8]>, new: Option<&[u8]>) -> Option<String> {
    if old == new {
        return None;
    }
    let binary = old.is_some_and(looks_binary) || new.is_some_and(looks_binary);
    let old_text = old.map(std::str::from_utf8);
    let new_text = new.map(std::str::from_utf8);
    match (old_text, new_text) {
        _ if binary => Some(binary_diff(rel, old.is_some(), new.is_some())),
        (Some(Ok(old)), Some(Ok(new))) => Some(unified_diff(rel, Some(old), new)),
        (None, Some(Ok(new))) => Some(unified_diff(rel, None, new)),
        (Some(Ok(old)), None) => Some(deletion_diff(rel, old)),
        _ => Some(binary_diff(rel, old.is_some(), new.is_some())),
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::io(format!("read {}", path.display()), err)),
    }
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dest: &Path) -> io::Result<()> {
    warn!(path = %src.display(), "skipping symlink");
    Ok(())
}

//! The fixed directory layout created under every subject.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::logging::log_fs_modification;
use crate::subject::Subject;

pub const RAW_DIR: &str = "RAW";
pub const DICOM_DIR: &str = "DICOM";
pub const META_DIR: &str = "META";

/// A named directory and its children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DirectoryNode>,
}

impl DirectoryNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn with_children(name: impl Into<String>, children: Vec<DirectoryNode>) -> Self {
        Self {
            name: name.into(),
            children,
        }
    }

    fn collect_paths(&self, parent: &Path, out: &mut Vec<PathBuf>) {
        let path = parent.join(&self.name);
        out.push(path.clone());
        for child in &self.children {
            child.collect_paths(&path, out);
        }
    }
}

/// Declarative description of the subtree created under each subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryTree {
    pub top: Vec<DirectoryNode>,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self {
            top: vec![
                DirectoryNode::with_children(RAW_DIR, vec![DirectoryNode::new(DICOM_DIR)]),
                DirectoryNode::new(META_DIR),
            ],
        }
    }
}

impl DirectoryTree {
    /// Every directory in the tree, relative to the subject top directory,
    /// parents before children
    pub fn relative_paths(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for node in &self.top {
            node.collect_paths(Path::new(""), &mut out);
        }
        out
    }

    /// Whether the tree contains the directories the subject layout relies on
    pub fn has_required_layout(&self) -> bool {
        let paths = self.relative_paths();
        let dicom = Path::new(RAW_DIR).join(DICOM_DIR);
        paths.contains(&dicom) && paths.contains(&PathBuf::from(META_DIR))
    }
}

/// Create the subject top directory and its whole tree. Safe to repeat.
pub fn ensure_structure(subject: &Subject) -> Result<()> {
    let top = subject.top_dir();
    let existed = top.is_dir();

    create_all(&top)?;
    for relative in subject.tree().relative_paths() {
        create_all(&top.join(relative))?;
    }
    // Always present, whatever the configured tree says
    create_all(&subject.dicom_dir())?;
    create_all(&subject.meta_dir())?;

    if !existed {
        log_fs_modification("create_subject", &top, Some(&subject.id().canonical()));
    }
    Ok(())
}

/// Create a brand-new subject directory.
///
/// The top directory is created exclusively, so a subject that already
/// exists is a `Conflict` unless `force` is set, in which case new data is
/// added to the existing subject. Returns whether the directory was new.
pub fn create_new(subject: &Subject, force: bool) -> Result<bool> {
    let top = subject.top_dir();
    create_all(subject.root())?;

    let created = match fs::create_dir(&top) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if !force {
                return Err(Error::Conflict(top));
            }
            log::info!("Adding to existing subject {}", subject.id());
            false
        }
        Err(e) => return Err(map_io(&top, e)),
    };

    ensure_structure(subject)?;
    Ok(created)
}

/// Resolve a directory below the subject top directory, creating it when
/// `build_if_needed` is set. The top directory itself must already exist.
pub fn resolve_subdir(subject: &Subject, segments: &[&str], build_if_needed: bool) -> Result<PathBuf> {
    let top = subject.top_dir();
    if !top.is_dir() {
        return Err(Error::Structure(top));
    }

    let dir = segments.iter().fold(top, |path, segment| path.join(segment));
    if build_if_needed && !dir.is_dir() {
        create_all(&dir)?;
    }
    Ok(dir)
}

/// Names of the immediate, non-hidden subdirectories of `root`, sorted
pub(crate) fn list_subdirectories(root: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(root).map_err(|e| map_io(root, e))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) if !name.starts_with('.') => names.push(name),
            Ok(_) => {}
            Err(name) => log::debug!("Skipping non UTF-8 directory name {:?}", name),
        }
    }
    names.sort();
    Ok(names)
}

fn create_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| map_io(path, e))
}

fn map_io(path: &Path, error: io::Error) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        Error::NotFound(path.to_path_buf())
    } else {
        Error::Io(error)
    }
}

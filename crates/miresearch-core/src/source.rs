//! Load sources: a directory, a single file, or a tar / tar.gz / zip
//! archive of DICOM files.
//!
//! Anything that is not a directory is unpacked or copied into a temporary
//! directory that lives as long as the [`StagedSource`].

use flate2::read::GzDecoder;
use log::info;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::error::{Error, Result};

/// How a load source is read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Directory,
    File,
    Tar,
    TarGz,
    Zip,
}

impl SourceKind {
    /// Kind of an existing path, judged by file type and extension
    pub fn of(path: &Path) -> Result<Self> {
        if path.is_dir() {
            return Ok(SourceKind::Directory);
        }
        if !path.is_file() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let kind = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            SourceKind::TarGz
        } else if name.ends_with(".tar") {
            SourceKind::Tar
        } else if name.ends_with(".zip") {
            SourceKind::Zip
        } else {
            SourceKind::File
        };
        Ok(kind)
    }
}

/// A load source available as a directory
#[derive(Debug)]
pub struct StagedSource {
    dir: PathBuf,
    kind: SourceKind,
    _staging: Option<TempDir>,
}

impl StagedSource {
    /// Directory holding the source's files
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }
}

/// Make `source` available as a directory
pub fn stage(source: &Path) -> Result<StagedSource> {
    let kind = SourceKind::of(source)?;
    if kind == SourceKind::Directory {
        return Ok(StagedSource {
            dir: source.to_path_buf(),
            kind,
            _staging: None,
        });
    }

    let staging = tempfile::Builder::new().prefix("miresearch-load").tempdir()?;
    let dir = staging.path().to_path_buf();
    match kind {
        SourceKind::File => {
            let name = source
                .file_name()
                .ok_or_else(|| Error::NotFound(source.to_path_buf()))?;
            fs::copy(source, dir.join(name))?;
        }
        SourceKind::Tar => {
            let mut archive = tar::Archive::new(BufReader::new(File::open(source)?));
            archive.unpack(&dir).map_err(|e| archive_error(source, e))?;
        }
        SourceKind::TarGz => {
            let decoder = GzDecoder::new(BufReader::new(File::open(source)?));
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(&dir).map_err(|e| archive_error(source, e))?;
        }
        SourceKind::Zip => {
            let mut archive =
                zip::ZipArchive::new(BufReader::new(File::open(source)?)).map_err(|e| archive_error(source, e))?;
            archive.extract(&dir).map_err(|e| archive_error(source, e))?;
        }
        SourceKind::Directory => {}
    }

    info!("Staged {:?} source {} in {}", kind, source.display(), dir.display());
    Ok(StagedSource {
        dir,
        kind,
        _staging: Some(staging),
    })
}

fn archive_error(path: &Path, error: impl std::fmt::Display) -> Error {
    Error::Archive {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}

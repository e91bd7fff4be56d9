//! Per-project subject behavior.
//!
//! Projects that need extra steps after import (derived series, extra
//! metadata) implement [`SubjectBehavior`] and hand it to the registry.
//! Every method has a default, so [`StandardSubject`] is an empty impl.

use std::path::Path;

use crate::dicom::DicomService;
use crate::error::Result;
use crate::identifier::SubjectId;
use crate::structure::DirectoryTree;
use crate::subject::Subject;

pub trait SubjectBehavior {
    /// Build the subject value for `id` under `root`
    fn construct(&self, id: SubjectId, root: &Path, tree: &DirectoryTree) -> Subject {
        Subject::new(id, root).with_tree(tree.clone())
    }

    /// Import `source` into `subject`
    fn load(
        &self,
        subject: &Subject,
        source: &Path,
        service: &dyn DicomService,
        anon_name: Option<&str>,
    ) -> Result<usize> {
        subject.load_dicoms(source, service, anon_name)
    }

    /// Runs after every import and on request
    fn post_process(&self, subject: &Subject) -> Result<()> {
        subject.build_series_meta_csv()?;
        Ok(())
    }
}

/// Default behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardSubject;

impl SubjectBehavior for StandardSubject {}

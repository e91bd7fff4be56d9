//! Core functionality for organising imaging research subjects on disk.
//!
//! This library provides the building blocks of a subject data store:
//! - Subject IDs and number allocation
//! - The per-subject directory layout and metadata cache
//! - DICOM import, anonymisation and archiving
//! - Subject lists with queries and summary reports

// -- External Dependencies --
use log::{debug, info};

// -- Standard Library --
use std::path::{Path, PathBuf};

// -- Internal Modules --
mod error;

// -- Public Re-exports --
pub use behavior::{StandardSubject, SubjectBehavior};
pub use collection::SubjectList;
pub use config::{Config, LogLevel};
pub use dicom::{DicomService, DicomToolkit};
pub use error::{Error, Result};
pub use identifier::SubjectId;
pub use metadata::{MetadataRecord, SeriesSummary};
pub use subject::{Subject, SubjectState};

// -- Public Modules --
pub mod allocator;
pub mod audit;
pub mod behavior;
pub mod collection;
pub mod config;
pub mod dicom;
pub mod identifier;
pub mod logging;
pub mod metadata;
pub mod report;
pub mod source;
pub mod structure;
pub mod subject;

// -- Test Support --
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

/// One import request
#[derive(Debug, Clone, Default)]
pub struct LoadRequest {
    /// Directory holding the DICOM files (or, with `multi`, one directory
    /// per study)
    pub source: PathBuf,

    /// Load into this subject number instead of allocating one
    pub number: Option<u64>,

    /// Add to an existing subject with the requested number
    pub force: bool,

    /// Patient name written into the imported files
    pub anon_name: Option<String>,

    /// Treat each subdirectory of `source` as its own study
    pub multi: bool,

    /// Always create a new subject, even when the study is already loaded
    pub ignore_uids: bool,
}

impl LoadRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }
}

/// Entry point tying configuration, DICOM handling and subject behavior
/// together for one data root
pub struct SubjectRegistry {
    config: Config,
    root: PathBuf,
    prefix: String,
    suffix: String,
    service: Box<dyn DicomService>,
    behavior: Box<dyn SubjectBehavior>,
}

impl SubjectRegistry {
    /// Create a registry using [`DicomToolkit`] and [`StandardSubject`]
    pub fn new(config: Config) -> Result<Self> {
        let toolkit = DicomToolkit::new(config.quiet).with_extra_study_tags(config.dicom_meta_tags.clone());
        Self::with_services(config, Box::new(toolkit), Box::new(StandardSubject))
    }

    /// Create a registry with a custom DICOM service and subject behavior.
    ///
    /// The subject prefix comes from the configuration, or is guessed from
    /// the subjects already in the data root.
    pub fn with_services(
        config: Config,
        service: Box<dyn DicomService>,
        behavior: Box<dyn SubjectBehavior>,
    ) -> Result<Self> {
        config.validate()?;
        let root = config.data_root()?.to_path_buf();
        let prefix = match &config.subject_prefix {
            Some(prefix) => prefix.clone(),
            None => identifier::guess_prefix(&root)?,
        };
        debug!("Registry on {} with prefix '{}'", root.display(), prefix);

        Ok(Self {
            config,
            root,
            prefix,
            suffix: String::new(),
            service,
            behavior,
        })
    }

    /// Suffix applied to subjects built from numbers (e.g. `_NN`)
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn service(&self) -> &dyn DicomService {
        self.service.as_ref()
    }

    pub fn behavior(&self) -> &dyn SubjectBehavior {
        self.behavior.as_ref()
    }

    /// Subject value for `number`; nothing is created
    pub fn subject(&self, number: u64) -> Subject {
        let id = SubjectId::new(self.prefix.as_str(), number, self.config.pad_width).with_suffix(self.suffix.as_str());
        self.subject_by_id(id)
    }

    pub fn subject_by_id(&self, id: SubjectId) -> Subject {
        self.behavior
            .construct(id, &self.root, &self.config.directory_structure)
    }

    pub fn subject_list(&self, numbers: &[u64]) -> SubjectList {
        numbers.iter().map(|n| self.subject(*n)).collect()
    }

    /// Every subject under the root with this registry's prefix
    pub fn all_subjects(&self) -> Result<SubjectList> {
        if !self.root.is_dir() {
            return Ok(SubjectList::default());
        }
        SubjectList::from_directory_with(&self.root, Some(&self.prefix), |id| self.subject_by_id(id))
    }

    /// The subject already holding the study with this StudyInstanceUID
    pub fn find_by_study_uid(&self, study_uid: &str) -> Result<Option<Subject>> {
        Ok(self.all_subjects()?.into_iter().find(|s| {
            s.tag_str(metadata::tags::STUDY_INSTANCE_UID).as_deref() == Some(study_uid)
        }))
    }

    /// Import one or more studies from a directory, a single file or a
    /// tar / tar.gz / zip archive. Returns the subjects loaded, in load
    /// order.
    pub fn load(&self, request: &LoadRequest) -> Result<SubjectList> {
        let staged = source::stage(&request.source)?;
        let root = staged.path();

        let sources: Vec<PathBuf> = if request.multi {
            structure::list_subdirectories(root)?
                .into_iter()
                .map(|name| root.join(name))
                .collect()
        } else {
            vec![root.to_path_buf()]
        };

        if request.number.is_some() && sources.len() > 1 {
            return Err(Error::Configuration(
                "A subject number cannot be given when loading several studies".to_string(),
            ));
        }

        let mut loaded = SubjectList::default();
        for source in &sources {
            loaded.push(self.load_study(source, request)?);
        }
        info!("Loaded {} studies from {}", loaded.len(), request.source.display());
        Ok(loaded)
    }

    fn load_study(&self, source: &Path, request: &LoadRequest) -> Result<Subject> {
        let subject = match request.number {
            Some(number) => {
                let subject = self.subject(number);
                structure::create_new(&subject, request.force)?;
                subject
            }
            None => match self.existing_for_source(source, request.ignore_uids)? {
                Some(subject) => {
                    info!("Study in {} already loaded as {}, adding to it", source.display(), subject.id());
                    subject.ensure_structure()?;
                    subject
                }
                None => {
                    let number = allocator::next_number(&self.root, &self.prefix)?;
                    let subject = self.subject(number);
                    structure::create_new(&subject, false)?;
                    subject
                }
            },
        };

        self.behavior
            .load(&subject, source, self.service.as_ref(), request.anon_name.as_deref())?;
        self.behavior.post_process(&subject)?;
        Ok(subject)
    }

    fn existing_for_source(&self, source: &Path, ignore_uids: bool) -> Result<Option<Subject>> {
        if ignore_uids {
            return Ok(None);
        }
        match self.service.study_instance_uid(source)? {
            Some(uid) => self.find_by_study_uid(&uid),
            None => Ok(None),
        }
    }

    /// Re-run post-processing on each subject, skipping those that fail
    pub fn run_post_process(&self, subjects: &SubjectList) -> usize {
        let mut done = 0;
        for subject in subjects {
            match self.behavior.post_process(subject) {
                Ok(()) => done += 1,
                Err(e) => log::warn!("Post-processing {} failed: {}", subject.id(), e),
            }
        }
        done
    }
}

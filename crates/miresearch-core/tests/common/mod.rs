#![allow(dead_code)]

use miresearch_core::metadata::MetadataRecord;
use miresearch_core::test_utils::FakeDicom;
use miresearch_core::{Config, StandardSubject, Subject, SubjectId, SubjectRegistry};
use std::path::Path;

/// Configuration for a test data root with the `MI` prefix
pub fn test_config(root: &Path) -> Config {
    Config {
        data_root: Some(root.to_path_buf()),
        subject_prefix: Some("MI".to_string()),
        quiet: true,
        ..Default::default()
    }
}

/// Registry over `root` backed by the fake DICOM service
pub fn test_registry(root: &Path) -> SubjectRegistry {
    SubjectRegistry::with_services(test_config(root), Box::new(FakeDicom), Box::new(StandardSubject))
        .expect("registry")
}

/// Create `MI<number>` under `root` with the given cached tags
pub fn make_subject(root: &Path, number: u64, tags: &[(&str, &str)]) -> Subject {
    let subject = Subject::new(SubjectId::new("MI", number, 6), root);
    subject.ensure_structure().expect("structure");
    if !tags.is_empty() {
        let mut record = MetadataRecord::new();
        for (tag, value) in tags {
            record.set(*tag, *value);
        }
        subject.update_meta(record, "").expect("metadata");
    }
    subject
}

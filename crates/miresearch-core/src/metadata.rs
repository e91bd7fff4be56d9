//! Per-subject metadata cache: `META/<ID>Tags<suffix>.json`.
//!
//! The file, when present, is the authoritative record of a subject's tags.
//! A missing file reads as an empty record; a missing key means "unknown".
//! Writes are read-modify-write and are not guarded against a concurrent
//! writer on the same subject.

use log::Level;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::structure::{resolve_subdir, META_DIR};
use crate::subject::Subject;

/// Reserved tag names
pub mod tags {
    pub const PATIENT_ID: &str = "PatientID";
    pub const PATIENT_NAME: &str = "PatientName";
    pub const PATIENT_BIRTH_DATE: &str = "PatientBirthDate";
    pub const PATIENT_SEX: &str = "PatientSex";
    pub const STUDY_DATE: &str = "StudyDate";
    pub const STUDY_DESCRIPTION: &str = "StudyDescription";
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const STUDY_ID: &str = "StudyID";
    pub const SCANNER_STUDY_ID: &str = "ScannerStudyID";
    pub const CONSENT: &str = "Consent";
    pub const ARCHIVED: &str = "ARCHIVED";
    pub const SERIES: &str = "Series";
}

/// Summary of one imaged series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SeriesSummary {
    pub series_number: Option<i64>,
    pub series_description: String,
    pub image_count: usize,

    /// Acquisition tags (EchoTime, RepetitionTime, ...) as text
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Contents of a metadata file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(rename = "Series", default, skip_serializing_if = "Option::is_none")]
    pub series: Option<Vec<SeriesSummary>>,

    #[serde(flatten)]
    pub tags: BTreeMap<String, Value>,
}

impl MetadataRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style tag insertion
    pub fn with_tag(mut self, tag: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(tag, value);
        self
    }

    pub fn with_series(mut self, series: Vec<SeriesSummary>) -> Self {
        self.series = Some(series);
        self
    }

    /// Set one tag. A `Series` value that parses as a series list goes to
    /// the typed field; anything else under `Series` is refused by [`write`].
    pub fn set(&mut self, tag: impl Into<String>, value: impl Into<Value>) {
        let tag = tag.into();
        let value = value.into();
        if tag == tags::SERIES {
            if let Ok(series) = serde_json::from_value::<Vec<SeriesSummary>>(value.clone()) {
                self.series = Some(series);
                return;
            }
        }
        self.tags.insert(tag, value);
    }

    /// Raw value of a tag; `Series` is returned as JSON
    pub fn get(&self, tag: &str) -> Option<Value> {
        if tag == tags::SERIES {
            return self
                .series
                .as_ref()
                .and_then(|series| serde_json::to_value(series).ok());
        }
        self.tags.get(tag).cloned()
    }

    /// Tag value as text. Numbers and booleans are formatted, other JSON
    /// shapes are not text.
    pub fn get_str(&self, tag: &str) -> Option<String> {
        match self.tags.get(tag)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(if *b { "True" } else { "False" }.to_string()),
            _ => None,
        }
    }

    pub fn series(&self) -> &[SeriesSummary] {
        self.series.as_deref().unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_none() && self.tags.is_empty()
    }

    /// Merge `other` into `self`; `other` wins per key and a present
    /// `Series` list replaces the old one whole.
    pub fn merge(&mut self, other: MetadataRecord) {
        if other.series.is_some() {
            self.series = other.series;
        }
        self.tags.extend(other.tags);
    }

    /// Move a raw `Series` entry into the typed field, failing when it is
    /// not a series list
    fn normalize(mut self) -> Result<Self> {
        if let Some(value) = self.tags.remove(tags::SERIES) {
            let series = serde_json::from_value(value).map_err(|e| Error::InvalidTag {
                tag: tags::SERIES.to_string(),
                reason: e.to_string(),
            })?;
            self.series = Some(series);
        }
        Ok(self)
    }

    fn describe_keys(&self) -> String {
        let mut keys: Vec<&str> = self.tags.keys().map(String::as_str).collect();
        if self.series.is_some() {
            keys.push(tags::SERIES);
        }
        keys.join(",")
    }
}

/// Read a subject's metadata. A missing file is an empty record.
pub fn read(subject: &Subject, suffix: &str) -> Result<MetadataRecord> {
    let path = subject.meta_tags_file(suffix);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MetadataRecord::default()),
        Err(e) => {
            return Err(Error::MetadataIo {
                path,
                reason: e.to_string(),
            })
        }
    };

    serde_json::from_str(&content).map_err(|e| Error::MetadataIo {
        path,
        reason: e.to_string(),
    })
}

/// Merge `partial` into the stored record, persist it atomically and append
/// an audit line. Returns the merged record.
pub fn write(subject: &Subject, partial: MetadataRecord, suffix: &str) -> Result<MetadataRecord> {
    let partial = partial.normalize()?;
    let meta_dir = resolve_subdir(subject, &[META_DIR], true)?;
    let path = subject.meta_tags_file(suffix);

    let keys = partial.describe_keys();
    let mut record = read(subject, suffix)?;
    record.merge(partial);
    persist_json(&meta_dir, &path, &record)?;

    subject.log(
        Level::Info,
        &format!("updateMetaFile{} [{}]", suffix, keys),
    )?;
    Ok(record)
}

/// Look up one tag. An unreadable file is an error.
pub fn get_tag(subject: &Subject, tag: &str, suffix: &str) -> Result<Option<Value>> {
    Ok(read(subject, suffix)?.get(tag))
}

/// Look up one tag, returning `not_found` when the tag is absent or the file
/// cannot be read
pub fn get_tag_or(subject: &Subject, tag: &str, suffix: &str, not_found: impl Into<Value>) -> Value {
    match get_tag(subject, tag, suffix) {
        Ok(Some(value)) => value,
        Ok(None) => not_found.into(),
        Err(e) => {
            log::debug!("Falling back to default for tag {} of {}: {}", tag, subject.id(), e);
            not_found.into()
        }
    }
}

fn persist_json(dir: &Path, path: &Path, record: &MetadataRecord) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, record)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::SubjectId;
    use crate::structure::ensure_structure;
    use serde_json::json;
    use tempfile::tempdir;

    fn materialized_subject(root: &Path) -> Subject {
        let subject = Subject::new(SubjectId::new("MI", 1, 6), root);
        ensure_structure(&subject).unwrap();
        subject
    }

    #[test]
    fn test_read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());
        assert!(read(&subject, "").unwrap().is_empty());

        // Also fine for a subject that was never created
        let ghost = Subject::new(SubjectId::new("MI", 99, 6), dir.path());
        assert!(read(&ghost, "").unwrap().is_empty());
    }

    #[test]
    fn test_write_merges_keys() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());

        write(&subject, MetadataRecord::new().with_tag("X", "1"), "").unwrap();
        write(&subject, MetadataRecord::new().with_tag("Y", "2"), "").unwrap();
        let record = read(&subject, "").unwrap();
        assert_eq!(record.get_str("X").as_deref(), Some("1"));
        assert_eq!(record.get_str("Y").as_deref(), Some("2"));

        write(&subject, MetadataRecord::new().with_tag("X", "3"), "").unwrap();
        let record = read(&subject, "").unwrap();
        assert_eq!(record.get_str("X").as_deref(), Some("3"));
        assert_eq!(record.get_str("Y").as_deref(), Some("2"));
    }

    #[test]
    fn test_write_appends_audit_line_per_write() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());

        write(&subject, MetadataRecord::new().with_tag("X", "1"), "").unwrap();
        write(&subject, MetadataRecord::new().with_tag("Y", "2"), "_ANON").unwrap();

        let log = fs::read_to_string(subject.log_file()).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("|INFO|updateMetaFile [X]"));
        assert!(lines[1].contains("|INFO|updateMetaFile_ANON [Y]"));
    }

    #[test]
    fn test_suffix_files_are_separate() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());

        write(&subject, MetadataRecord::new().with_tag("PatientName", "Anon"), "_ANON").unwrap();
        assert!(dir.path().join("MI000001/META/MI000001Tags_ANON.json").is_file());
        assert!(!subject.meta_tags_file("").exists());
        assert_eq!(get_tag(&subject, "PatientName", "").unwrap(), None);
    }

    #[test]
    fn test_write_requires_subject() {
        let dir = tempdir().unwrap();
        let ghost = Subject::new(SubjectId::new("MI", 5, 6), dir.path());
        let result = write(&ghost, MetadataRecord::new().with_tag("X", "1"), "");
        assert!(matches!(result, Err(Error::Structure(_))));
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());
        fs::write(subject.meta_tags_file(""), b"{ not json").unwrap();

        assert!(matches!(read(&subject, ""), Err(Error::MetadataIo { .. })));
        assert!(matches!(
            get_tag(&subject, "PatientID", ""),
            Err(Error::MetadataIo { .. })
        ));
        assert_eq!(get_tag_or(&subject, "PatientID", "", "Unknown"), json!("Unknown"));
    }

    #[test]
    fn test_series_is_typed_and_replaced_whole() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());

        let first = vec![
            SeriesSummary {
                series_number: Some(1),
                series_description: "Localiser".to_string(),
                image_count: 3,
                tags: BTreeMap::new(),
            },
            SeriesSummary {
                series_number: Some(41),
                series_description: "RVLA cine".to_string(),
                image_count: 30,
                tags: BTreeMap::from([("EchoTime".to_string(), "1.2".to_string())]),
            },
        ];
        write(&subject, MetadataRecord::new().with_series(first.clone()), "").unwrap();
        write(&subject, MetadataRecord::new().with_tag("StudyDate", "20140409"), "").unwrap();

        let record = read(&subject, "").unwrap();
        assert_eq!(record.series(), first.as_slice());

        let raw: Value = serde_json::from_str(&fs::read_to_string(subject.meta_tags_file("")).unwrap()).unwrap();
        assert_eq!(raw["Series"][1]["SeriesNumber"], json!(41));
        assert_eq!(raw["Series"][1]["Tags"]["EchoTime"], json!("1.2"));
        assert_eq!(raw["StudyDate"], json!("20140409"));

        write(&subject, MetadataRecord::new().with_series(vec![]), "").unwrap();
        assert!(read(&subject, "").unwrap().series().is_empty());
    }

    #[test]
    fn test_series_tag_cannot_corrupt_file() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());
        write(&subject, MetadataRecord::new().with_tag("PatientID", "123"), "").unwrap();

        let result = write(&subject, MetadataRecord::new().with_tag("Series", json!("none")), "");
        assert!(matches!(result, Err(Error::InvalidTag { ref tag, .. }) if tag == "Series"));

        // Raw map entries are checked too
        let mut raw = MetadataRecord::new();
        raw.tags.insert("Series".to_string(), json!(42));
        assert!(matches!(write(&subject, raw, ""), Err(Error::InvalidTag { .. })));

        let record = read(&subject, "").unwrap();
        assert_eq!(record.get_str("PatientID").as_deref(), Some("123"));
        assert!(record.series.is_none());
    }

    #[test]
    fn test_series_tag_as_json_is_typed() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());
        let series = json!([{"SeriesNumber": 3, "SeriesDescription": "T1", "ImageCount": 12}]);

        let record = MetadataRecord::new().with_tag("Series", series.clone());
        assert!(record.tags.is_empty());
        write(&subject, record, "").unwrap();

        let record = read(&subject, "").unwrap();
        assert_eq!(record.series().len(), 1);
        assert_eq!(record.series()[0].series_number, Some(3));
        assert_eq!(record.get("Series"), Some(series));
    }

    #[test]
    fn test_numbers_read_as_text() {
        let record: MetadataRecord =
            serde_json::from_str(r#"{"PatientWeight": 80, "StudyID": "12", "ARCHIVED": "True"}"#).unwrap();
        assert_eq!(record.get_str("PatientWeight").as_deref(), Some("80"));
        assert_eq!(record.get_str("StudyID").as_deref(), Some("12"));
        assert_eq!(record.get_str("Missing"), None);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let subject = materialized_subject(dir.path());
        write(&subject, MetadataRecord::new().with_tag("X", "1"), "").unwrap();

        let mut names: Vec<String> = fs::read_dir(subject.meta_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["MI000001.log", "MI000001Tags.json"]);
    }
}

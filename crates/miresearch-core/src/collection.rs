//! Ordered lists of subjects sharing a root, with queries and reports.
//!
//! Collection operations never fail because of one bad subject: unreadable
//! names or metadata make that subject drop out of the result, with a debug
//! log line.

use chrono::NaiveDate;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::identifier::SubjectId;
use crate::metadata::tags;
use crate::report::{self, SummaryRow, SUMMARY_HEADER};
use crate::structure::list_subdirectories;
use crate::subject::{parse_dicom_date, Subject};

/// Caller-supplied decoder for obfuscated stored names
pub type NameDecoder<'a> = &'a dyn Fn(&str) -> String;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectList(Vec<Subject>);

impl SubjectList {
    pub fn new(subjects: Vec<Subject>) -> Self {
        Self(subjects)
    }

    /// Every subject directory directly under `root`, sorted
    pub fn from_directory(root: &Path, prefix_filter: Option<&str>) -> Result<Self> {
        Self::from_directory_with(root, prefix_filter, |id| Subject::new(id, root))
    }

    /// As [`SubjectList::from_directory`], building each subject with `build`
    pub fn from_directory_with<F>(root: &Path, prefix_filter: Option<&str>, build: F) -> Result<Self>
    where
        F: Fn(SubjectId) -> Subject,
    {
        let mut subjects = Vec::new();
        for name in list_subdirectories(root)? {
            let id = match SubjectId::parse(&name) {
                Ok(id) => id,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            };
            if prefix_filter.is_some_and(|prefix| id.prefix() != prefix) {
                continue;
            }
            let subject = build(id);
            // The directory may have gone since the scan
            if subject.exists() {
                subjects.push(subject);
            }
        }
        subjects.sort();
        Ok(Self(subjects))
    }

    /// Subjects for explicit numbers, in the order given. Nothing is checked
    /// on disk.
    pub fn from_numbers(root: &Path, prefix: &str, numbers: &[u64], pad_width: usize, suffix: &str) -> Self {
        numbers
            .iter()
            .map(|n| Subject::new(SubjectId::new(prefix, *n, pad_width).with_suffix(suffix), root))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Subject> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Subject] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<Subject> {
        self.0
    }

    pub fn push(&mut self, subject: Subject) {
        self.0.push(subject);
    }

    pub fn sort(&mut self) {
        self.0.sort();
    }

    /// Subject numbers, skipping opaque IDs
    pub fn numbers(&self) -> Vec<u64> {
        self.0.iter().filter_map(|s| s.id().number()).collect()
    }

    fn retained<P: FnMut(&Subject) -> bool>(&self, mut keep: P) -> Self {
        self.0.iter().filter(|&s| keep(s)).cloned().collect()
    }

    // -- Queries --

    /// Subjects scanned between `start` and `end` inclusive. Subjects with a
    /// missing or malformed `StudyDate` are left out.
    pub fn filter_by_date_of_scan(&self, start: NaiveDate, end: NaiveDate) -> Self {
        self.retained(|s| match s.study_date() {
            Some(date) => date >= start && date <= end,
            None => {
                debug!("{} has no usable StudyDate", s.id());
                false
            }
        })
    }

    pub fn find_matching_patient_id(&self, patient_id: &str) -> Self {
        self.retained(|s| s.tag_str(tags::PATIENT_ID).as_deref() == Some(patient_id))
    }

    pub fn find_matching_study_id(&self, study_id: &str) -> Self {
        self.retained(|s| s.study_id().as_deref() == Some(study_id))
    }

    /// Case-insensitive substring match on `PatientName`, decoding the
    /// stored name first when a decoder is given
    pub fn find_matching_name(&self, text: &str, decoder: Option<NameDecoder<'_>>) -> Self {
        let needle = text.to_lowercase();
        self.retained(|s| {
            let Some(stored) = s.tag_str(tags::PATIENT_NAME) else {
                return false;
            };
            let name = match decoder {
                Some(decode) => decode(&stored),
                None => stored,
            };
            name.to_lowercase().contains(&needle)
        })
    }

    /// Subjects with at least one cached series whose description contains
    /// `description`, ignoring case
    pub fn find_matching_series_description(&self, description: &str) -> Self {
        self.retained(|s| !s.series_numbers_matching(description).is_empty())
    }

    /// Drop subjects whose directory no longer exists
    pub fn reduce_to_existing(&self) -> Self {
        self.retained(Subject::exists)
    }

    /// Drop repeated subjects, keeping the first of each
    pub fn reduce_to_set(&self) -> Self {
        let mut seen = HashSet::new();
        self.retained(|s| seen.insert(s.clone()))
    }

    // -- Reports --

    pub fn table_rows(&self) -> Vec<SummaryRow> {
        self.0.iter().map(Subject::summary_row).collect()
    }

    /// One row per subject in list order, with `extra_tags` as trailing
    /// columns
    pub fn write_summary_csv(&self, path: &Path, extra_tags: &[&str]) -> Result<()> {
        let mut header: Vec<&str> = SUMMARY_HEADER.to_vec();
        header.extend_from_slice(extra_tags);

        let rows: Vec<Vec<String>> = self
            .0
            .iter()
            .map(|s| {
                let mut row = s.summary_row().fields();
                row.extend(
                    extra_tags
                        .iter()
                        .map(|tag| s.tag_str(tag).unwrap_or_else(|| report::UNKNOWN.to_string())),
                );
                row
            })
            .collect();

        report::write_csv(path, &header, &rows)?;
        info!("Wrote summary of {} subjects to {}", rows.len(), path.display());
        Ok(())
    }
}

/// Read subject numbers from a text file. Numbers may be separated by
/// whitespace or commas and may be full IDs (`MI000012`); `#` starts a
/// comment.
pub fn read_subject_numbers(path: &Path) -> Result<Vec<u64>> {
    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound(path.to_path_buf()),
        _ => Error::Io(e),
    })?;

    let mut numbers = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default();
        for token in line.split(|c: char| c == ',' || c.is_whitespace()) {
            if token.is_empty() {
                continue;
            }
            match token.parse::<u64>() {
                Ok(n) => numbers.push(n),
                Err(_) => match SubjectId::parse(token).ok().and_then(|id| id.number()) {
                    Some(n) => numbers.push(n),
                    None => warn!("Ignoring '{}' in {}", token, path.display()),
                },
            }
        }
    }
    Ok(numbers)
}

/// `YYYYMMDD` to a date
pub fn parse_scan_date(text: &str) -> Result<NaiveDate> {
    parse_dicom_date(text).ok_or_else(|| Error::format(text, "expected a YYYYMMDD date"))
}

impl FromIterator<Subject> for SubjectList {
    fn from_iter<I: IntoIterator<Item = Subject>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SubjectList {
    type Item = Subject;
    type IntoIter = std::vec::IntoIter<Subject>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SubjectList {
    type Item = &'a Subject;
    type IntoIter = std::slice::Iter<'a, Subject>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

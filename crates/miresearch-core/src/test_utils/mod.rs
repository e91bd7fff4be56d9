//! A text-file stand-in for DICOM data, for tests.
//!
//! Each fake instance is a UTF-8 file of `Key=Value` lines. [`FakeDicom`]
//! organises, summarises and anonymises those files the way
//! [`crate::dicom::DicomToolkit`] handles real DICOM.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::dicom::{format_series_dir_name, instance_target, DicomService, StudySummary};
use crate::error::{Error, Result};
use crate::metadata::SeriesSummary;

const SERIES_KEYS: [&str; 4] = ["SeriesNumber", "SeriesDescription", "InstanceNumber", "SOPInstanceUID"];

/// [`DicomService`] over `Key=Value` text files
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeDicom;

/// Write one fake instance per image for each `(number, description,
/// image_count)` series. Returns the files written.
pub fn write_fake_study(
    dir: &Path,
    study_uid: &str,
    patient_id: &str,
    series: &[(i64, &str, usize)],
) -> Vec<PathBuf> {
    write_fake_study_with(dir, study_uid, patient_id, &[], series)
}

/// Like [`write_fake_study`] with extra study-level tags
pub fn write_fake_study_with(
    dir: &Path,
    study_uid: &str,
    patient_id: &str,
    extra_tags: &[(&str, &str)],
    series: &[(i64, &str, usize)],
) -> Vec<PathBuf> {
    let mut written = Vec::new();
    if fs::create_dir_all(dir).is_err() {
        return written;
    }
    for (number, description, count) in series {
        for instance in 1..=*count {
            let mut tags = BTreeMap::new();
            tags.insert("StudyInstanceUID".to_string(), study_uid.to_string());
            tags.insert("PatientID".to_string(), patient_id.to_string());
            tags.insert("PatientName".to_string(), "Doe^Jane".to_string());
            tags.insert("SeriesNumber".to_string(), number.to_string());
            tags.insert("SeriesDescription".to_string(), description.to_string());
            tags.insert("InstanceNumber".to_string(), instance.to_string());
            tags.insert(
                "SOPInstanceUID".to_string(),
                format!("{}.{}.{}", study_uid, number, instance),
            );
            for (key, value) in extra_tags {
                tags.insert(key.to_string(), value.to_string());
            }

            let path = dir.join(format!("{}_{}_{}.fake", study_uid, number, instance));
            if fs::write(&path, render(&tags)).is_ok() {
                written.push(path);
            }
        }
    }
    written
}

fn render(tags: &BTreeMap<String, String>) -> String {
    tags.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect()
}

/// `None` for anything that is not a fake instance
fn parse(path: &Path) -> Option<BTreeMap<String, String>> {
    let text = fs::read_to_string(path).ok()?;
    let tags: BTreeMap<String, String> = text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    tags.contains_key("StudyInstanceUID").then_some(tags)
}

fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    Ok(files)
}

impl DicomService for FakeDicom {
    fn organise(&self, source: &Path, dest: &Path, anon_name: Option<&str>) -> Result<usize> {
        let mut written = 0;
        for path in files_under(source)? {
            let Some(mut tags) = parse(&path) else {
                continue;
            };
            let number = tags.get("SeriesNumber").cloned().unwrap_or_default();
            let description = tags.get("SeriesDescription").cloned().unwrap_or_default();
            let instance: u32 = tags
                .get("InstanceNumber")
                .and_then(|n| n.parse().ok())
                .unwrap_or_default();

            let series_dir = dest.join(format_series_dir_name(&number, &description));
            fs::create_dir_all(&series_dir)?;
            let sop_uid = tags.get("SOPInstanceUID").cloned();
            let same_instance = |existing: &Path| {
                sop_uid.is_some() && parse(existing).and_then(|t| t.get("SOPInstanceUID").cloned()) == sop_uid
            };
            let Some(target) = instance_target(&series_dir, &format!("IM-{:05}", instance), same_instance) else {
                continue;
            };
            if let Some(name) = anon_name {
                tags.insert("PatientName".to_string(), name.to_string());
            }
            fs::write(target, render(&tags))?;
            written += 1;
        }
        Ok(written)
    }

    fn study_summary(&self, dicom_dir: &Path) -> Result<StudySummary> {
        let mut summary = StudySummary::default();
        let mut series_dirs: Vec<PathBuf> = fs::read_dir(dicom_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        series_dirs.sort();

        for series_dir in series_dirs {
            let files = files_under(&series_dir)?;
            let Some(tags) = files.iter().find_map(|p| parse(p)) else {
                continue;
            };
            if summary.tags.is_empty() {
                summary.tags = tags
                    .iter()
                    .filter(|(k, _)| !SERIES_KEYS.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }
            summary.series.push(SeriesSummary {
                series_number: tags.get("SeriesNumber").and_then(|n| n.parse().ok()),
                series_description: tags.get("SeriesDescription").cloned().unwrap_or_default(),
                image_count: files.len(),
                tags: BTreeMap::new(),
            });
        }
        summary.series.sort_by_key(|s| s.series_number);
        Ok(summary)
    }

    fn study_instance_uid(&self, source: &Path) -> Result<Option<String>> {
        Ok(files_under(source)?
            .iter()
            .find_map(|p| parse(p))
            .and_then(|tags| tags.get("StudyInstanceUID").cloned()))
    }

    fn anonymise(&self, dicom_dir: &Path, name: &str) -> Result<usize> {
        let mut rewritten = 0;
        for path in files_under(dicom_dir)? {
            let Some(mut tags) = parse(&path) else {
                continue;
            };
            tags.insert("PatientName".to_string(), name.to_string());
            fs::write(&path, render(&tags))?;
            rewritten += 1;
        }
        Ok(rewritten)
    }
}

//! DICOM import, summarising and anonymisation.
//!
//! Everything the subject layer needs from DICOM files goes through
//! [`DicomService`]. [`DicomToolkit`] is the implementation backed by the
//! `dicom` crate.

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::logging::log_file_error;
use crate::metadata::SeriesSummary;

/// Study-level tags always cached for a subject
pub const STUDY_TAGS: &[&str] = &[
    "PatientID",
    "PatientName",
    "PatientBirthDate",
    "PatientSex",
    "PatientAge",
    "StudyDate",
    "StudyTime",
    "StudyDescription",
    "StudyInstanceUID",
    "StudyID",
    "AccessionNumber",
    "InstitutionName",
    "Manufacturer",
    "ManufacturerModelName",
    "MagneticFieldStrength",
];

/// Acquisition tags recorded for each series
pub const SERIES_TAGS: &[&str] = &[
    "SeriesInstanceUID",
    "SeriesTime",
    "Modality",
    "EchoTime",
    "RepetitionTime",
    "FlipAngle",
    "SliceThickness",
    "SpacingBetweenSlices",
    "PixelSpacing",
    "Rows",
    "Columns",
];

/// Tags and series of one imaging study
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudySummary {
    pub tags: BTreeMap<String, String>,
    pub series: Vec<SeriesSummary>,
}

/// Operations on DICOM data needed by subjects
pub trait DicomService {
    /// Copy every DICOM file under `source` into `dest`, one directory per
    /// series, optionally replacing the patient name. Returns the number of
    /// files written.
    fn organise(&self, source: &Path, dest: &Path, anon_name: Option<&str>) -> Result<usize>;

    /// Summarise an organised study directory
    fn study_summary(&self, dicom_dir: &Path) -> Result<StudySummary>;

    /// StudyInstanceUID of the first readable file under `source`
    fn study_instance_uid(&self, source: &Path) -> Result<Option<String>>;

    /// Replace the patient name in every file under `dicom_dir`. Returns
    /// the number of files rewritten.
    fn anonymise(&self, dicom_dir: &Path, name: &str) -> Result<usize>;
}

/// [`DicomService`] backed by the `dicom` crate
#[derive(Debug, Clone, Default)]
pub struct DicomToolkit {
    quiet: bool,
    extra_study_tags: Vec<String>,
}

impl DicomToolkit {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            extra_study_tags: Vec::new(),
        }
    }

    /// Cache these study-level tags in addition to [`STUDY_TAGS`]
    pub fn with_extra_study_tags(mut self, tags: Vec<String>) -> Self {
        self.extra_study_tags = tags;
        self
    }

    fn progress_bar(&self, len: usize, message: &'static str) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) - {msg}")
        {
            progress.set_style(style.progress_chars("#>-"));
        }
        progress.set_message(message);
        progress
    }

    fn study_tags(&self, object: &DefaultDicomObject) -> BTreeMap<String, String> {
        STUDY_TAGS
            .iter()
            .copied()
            .chain(self.extra_study_tags.iter().map(String::as_str))
            .filter_map(|name| attribute_text(object, name).map(|value| (name.to_string(), value)))
            .collect()
    }
}

impl DicomService for DicomToolkit {
    fn organise(&self, source: &Path, dest: &Path, anon_name: Option<&str>) -> Result<usize> {
        let files = files_under(source)?;
        fs::create_dir_all(dest)?;

        let progress = self.progress_bar(files.len(), "Organising DICOM files");
        let mut written = 0;
        let mut skipped = 0;
        let mut duplicates = 0;

        for path in &files {
            progress.inc(1);
            let Some(mut object) = open_dicom(path) else {
                skipped += 1;
                continue;
            };

            let series_dir = dest.join(series_dir_name(&object));
            fs::create_dir_all(&series_dir)?;
            let sop_uid = attribute_text(&object, "SOPInstanceUID");
            let same_instance = |existing: &Path| {
                sop_uid.is_some()
                    && open_dicom(existing).and_then(|o| attribute_text(&o, "SOPInstanceUID")) == sop_uid
            };
            let Some(target) = instance_target(&series_dir, &instance_file_stem(&object, path), same_instance)
            else {
                debug!("Instance in {} is already stored", path.display());
                duplicates += 1;
                continue;
            };

            match anon_name {
                Some(name) => {
                    set_patient_name(&mut object, name);
                    object
                        .write_to_file(&target)
                        .map_err(|e| Error::Dicom(format!("{}: {}", target.display(), e)))?;
                }
                None => {
                    if let Err(e) = fs::copy(path, &target) {
                        log_file_error(path, "copy", &e);
                        return Err(e.into());
                    }
                }
            }
            written += 1;
        }
        progress.finish_and_clear();

        if skipped > 0 {
            info!("Skipped {} non-DICOM files under {}", skipped, source.display());
        }
        if duplicates > 0 {
            warn!(
                "Skipped {} instances from {} already present in {}",
                duplicates,
                source.display(),
                dest.display()
            );
        }
        info!(
            "Organised {} DICOM files from {} into {}",
            written,
            source.display(),
            dest.display()
        );
        Ok(written)
    }

    fn study_summary(&self, dicom_dir: &Path) -> Result<StudySummary> {
        let mut summary = StudySummary::default();
        let mut series_dirs: Vec<PathBuf> = fs::read_dir(dicom_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        series_dirs.sort();

        for series_dir in series_dirs {
            let files = files_under(&series_dir)?;
            let Some(object) = files.iter().find_map(|path| open_dicom(path)) else {
                debug!("No readable DICOM in {}", series_dir.display());
                continue;
            };

            if summary.tags.is_empty() {
                summary.tags = self.study_tags(&object);
            }

            let series_tags = SERIES_TAGS
                .iter()
                .filter_map(|name| attribute_text(&object, name).map(|v| (name.to_string(), v)))
                .collect();

            summary.series.push(SeriesSummary {
                series_number: attribute_text(&object, "SeriesNumber").and_then(|s| s.parse().ok()),
                series_description: attribute_text(&object, "SeriesDescription").unwrap_or_default(),
                image_count: files.len(),
                tags: series_tags,
            });
        }

        summary.series.sort_by_key(|s| s.series_number);
        Ok(summary)
    }

    fn study_instance_uid(&self, source: &Path) -> Result<Option<String>> {
        for path in files_under(source)? {
            if let Some(object) = open_dicom(&path) {
                return Ok(attribute_text(&object, "StudyInstanceUID"));
            }
        }
        Ok(None)
    }

    fn anonymise(&self, dicom_dir: &Path, name: &str) -> Result<usize> {
        let files = files_under(dicom_dir)?;
        let progress = self.progress_bar(files.len(), "Anonymising");
        let mut rewritten = 0;

        for path in &files {
            progress.inc(1);
            let Some(mut object) = open_dicom(path) else {
                continue;
            };
            set_patient_name(&mut object, name);
            object
                .write_to_file(path)
                .map_err(|e| Error::Dicom(format!("{}: {}", path.display(), e)))?;
            rewritten += 1;
        }
        progress.finish_and_clear();
        Ok(rewritten)
    }
}

/// Regular files below `dir`, sorted
fn files_under(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::NotFound(dir.to_path_buf()));
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Error walking {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    Ok(files)
}

fn open_dicom(path: &Path) -> Option<DefaultDicomObject> {
    match open_file(path) {
        Ok(object) => Some(object),
        Err(e) => {
            debug!("Not a readable DICOM file {}: {}", path.display(), e);
            None
        }
    }
}

fn attribute_text(object: &DefaultDicomObject, name: &str) -> Option<String> {
    object
        .element_by_name(name)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .filter(|value| !value.is_empty())
}

fn set_patient_name(object: &mut DefaultDicomObject, name: &str) {
    object.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        PrimitiveValue::from(name),
    ));
}

/// `SE<number>_<description>` with unsafe characters replaced
pub fn series_dir_name(object: &DefaultDicomObject) -> String {
    let number = attribute_text(object, "SeriesNumber").unwrap_or_else(|| "0".to_string());
    let description = attribute_text(object, "SeriesDescription").unwrap_or_default();
    format_series_dir_name(&number, &description)
}

pub(crate) fn format_series_dir_name(number: &str, description: &str) -> String {
    let clean: String = description
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if clean.is_empty() {
        format!("SE{}", number)
    } else {
        format!("SE{}_{}", number, clean)
    }
}

fn instance_file_stem(object: &DefaultDicomObject, source: &Path) -> String {
    match attribute_text(object, "InstanceNumber").and_then(|n| n.parse::<u32>().ok()) {
        Some(instance) => format!("IM-{:05}", instance),
        None => {
            debug!("No InstanceNumber in {}, keeping file name", source.display());
            source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unnamed".to_string())
        }
    }
}

/// Free path for an instance in `series_dir`: `<stem>.dcm`, then
/// `<stem>-1.dcm`, `<stem>-2.dcm`, ... `None` when `same_instance` says an
/// occupied candidate already holds this instance.
pub(crate) fn instance_target(
    series_dir: &Path,
    stem: &str,
    same_instance: impl Fn(&Path) -> bool,
) -> Option<PathBuf> {
    let mut candidate = series_dir.join(format!("{}.dcm", stem));
    let mut n = 1;
    while candidate.exists() {
        if same_instance(&candidate) {
            return None;
        }
        candidate = series_dir.join(format!("{}-{}.dcm", stem, n));
        n += 1;
    }
    Some(candidate)
}

/// Series number from a `SE<number>_...` directory name
pub fn series_number_from_dir_name(name: &str) -> Option<i64> {
    let rest = name.strip_prefix("SE")?;
    let digits = rest.split('_').next()?;
    digits.parse().ok()
}

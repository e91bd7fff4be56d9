//! A single research subject and its directory on disk.
//!
//! A [`Subject`] is just an identity and a root: constructing one never
//! touches the filesystem. Every path is derived from `root` and the
//! canonical ID on demand, so a renamed subject has no stale paths.

use chrono::NaiveDate;
use log::Level;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::audit::AuditLog;
use crate::dicom::{series_number_from_dir_name, DicomService};
use crate::error::{Error, Result};
use crate::identifier::SubjectId;
use crate::logging::{log_file_error, log_fs_modification};
use crate::metadata::{self, tags, MetadataRecord};
use crate::report::{self, SummaryRow, UNKNOWN};
use crate::source::stage;
use crate::structure::{self, list_subdirectories, DirectoryTree, DICOM_DIR, META_DIR, RAW_DIR};

/// Per-series acquisition summary written next to the metadata
pub const SERIES_CSV_NAME: &str = "ScanSeriesInfo.csv";

/// Tags reported by [`Subject::info`], followed by `Age`
pub const INFO_KEYS: [&str; 9] = [
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_ID,
    tags::PATIENT_NAME,
    tags::PATIENT_SEX,
    tags::STUDY_DATE,
    tags::STUDY_DESCRIPTION,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_ID,
    tags::CONSENT,
];

/// DICOM date layout (`YYYYMMDD`)
pub const DICOM_DATE_FORMAT: &str = "%Y%m%d";

/// Lifecycle position of a subject on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectState {
    /// No top directory yet
    Unmaterialized,
    /// Directory tree exists but holds no imaging data
    Materialized,
    /// Imaging data or cached series are present
    Populated,
    /// Flagged as archived
    Archived,
}

impl fmt::Display for SubjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubjectState::Unmaterialized => "unmaterialized",
            SubjectState::Materialized => "materialized",
            SubjectState::Populated => "populated",
            SubjectState::Archived => "archived",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Subject {
    id: SubjectId,
    root: PathBuf,
    tree: DirectoryTree,
}

impl Subject {
    pub fn new(id: SubjectId, root: impl Into<PathBuf>) -> Self {
        Self {
            id,
            root: root.into(),
            tree: DirectoryTree::default(),
        }
    }

    pub fn with_tree(mut self, tree: DirectoryTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn id(&self) -> &SubjectId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    // -- Paths --

    pub fn top_dir(&self) -> PathBuf {
        self.root.join(self.id.canonical())
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.top_dir().join(RAW_DIR)
    }

    pub fn dicom_dir(&self) -> PathBuf {
        self.raw_dir().join(DICOM_DIR)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.top_dir().join(META_DIR)
    }

    pub fn meta_tags_file(&self, suffix: &str) -> PathBuf {
        self.meta_dir()
            .join(format!("{}Tags{}.json", self.id.canonical(), suffix))
    }

    pub fn log_file(&self) -> PathBuf {
        self.meta_dir().join(format!("{}.log", self.id.canonical()))
    }

    pub fn series_csv_file(&self) -> PathBuf {
        self.meta_dir().join(SERIES_CSV_NAME)
    }

    // -- State --

    pub fn exists(&self) -> bool {
        self.top_dir().is_dir()
    }

    pub fn state(&self) -> SubjectState {
        if !self.exists() {
            return SubjectState::Unmaterialized;
        }
        if self.is_archived() {
            return SubjectState::Archived;
        }
        let has_series = self
            .read_meta("")
            .map(|record| !record.series().is_empty())
            .unwrap_or(false);
        if has_series || self.count_dicoms() > 0 {
            SubjectState::Populated
        } else {
            SubjectState::Materialized
        }
    }

    /// Create the directory tree; safe to repeat
    pub fn ensure_structure(&self) -> Result<()> {
        structure::ensure_structure(self)
    }

    /// Append a line to the subject's audit log
    pub fn log(&self, level: Level, message: &str) -> Result<()> {
        structure::resolve_subdir(self, &[META_DIR], true)?;
        AuditLog::open(&self.log_file(), &self.id.canonical())?.record(level, message)
    }

    // -- Metadata --

    pub fn read_meta(&self, suffix: &str) -> Result<MetadataRecord> {
        metadata::read(self, suffix)
    }

    pub fn update_meta(&self, partial: MetadataRecord, suffix: &str) -> Result<MetadataRecord> {
        metadata::write(self, partial, suffix)
    }

    pub fn set_tag(&self, tag: &str, value: impl Into<Value>) -> Result<()> {
        self.update_meta(MetadataRecord::new().with_tag(tag, value), "")?;
        Ok(())
    }

    pub fn get_tag(&self, tag: &str) -> Result<Option<Value>> {
        metadata::get_tag(self, tag, "")
    }

    pub fn get_tag_or(&self, tag: &str, not_found: impl Into<Value>) -> Value {
        metadata::get_tag_or(self, tag, "", not_found)
    }

    /// Tag as text; unreadable metadata counts as unknown
    pub fn tag_str(&self, tag: &str) -> Option<String> {
        self.read_meta("").ok()?.get_str(tag)
    }

    pub fn study_date(&self) -> Option<NaiveDate> {
        parse_dicom_date(&self.tag_str(tags::STUDY_DATE)?)
    }

    /// `StudyID`, or `ScannerStudyID` when the scanner wrote a zero study ID
    pub fn study_id(&self) -> Option<String> {
        match self.tag_str(tags::STUDY_ID) {
            Some(id) if id == "0" => self.tag_str(tags::SCANNER_STUDY_ID).or(Some(id)),
            other => other,
        }
    }

    pub fn set_archived(&self) -> Result<()> {
        self.set_tag(tags::ARCHIVED, "True")?;
        self.log(Level::Info, "Set archived")
    }

    pub fn is_archived(&self) -> bool {
        self.tag_str(tags::ARCHIVED).as_deref() == Some("True")
    }

    // -- DICOM --

    /// Import a DICOM study from `source` (directory, file or archive), then
    /// refresh the cached tags
    pub fn load_dicoms(
        &self,
        source: &Path,
        service: &dyn DicomService,
        anon_name: Option<&str>,
    ) -> Result<usize> {
        let staged = stage(source)?;
        self.ensure_structure()?;

        let count = service.organise(staged.path(), &self.dicom_dir(), anon_name)?;
        self.log(
            Level::Info,
            &format!("Loaded {} DICOM files from {}", count, source.display()),
        )?;
        self.build_dicom_meta(service)?;
        Ok(count)
    }

    /// Cache study tags and the series list from the organised DICOM data
    pub fn build_dicom_meta(&self, service: &dyn DicomService) -> Result<MetadataRecord> {
        let summary = service.study_summary(&self.dicom_dir())?;
        let mut partial = MetadataRecord::new().with_series(summary.series);
        for (tag, value) in summary.tags {
            partial.set(tag, value);
        }
        self.update_meta(partial, "")
    }

    /// Replace the patient name in the DICOM files and the cache. Repeating
    /// it with the same name changes nothing further.
    pub fn anonymise(&self, name: &str, service: &dyn DicomService) -> Result<usize> {
        if !self.exists() {
            return Err(Error::Structure(self.top_dir()));
        }
        let dicom_dir = self.dicom_dir();
        let count = if dicom_dir.is_dir() {
            service.anonymise(&dicom_dir, name)?
        } else {
            0
        };
        self.set_tag(tags::PATIENT_NAME, name)?;
        self.log(Level::Info, &format!("Anonymised {} files", count))?;
        Ok(count)
    }

    /// Number of files under `RAW/DICOM`
    pub fn count_dicoms(&self) -> usize {
        WalkDir::new(self.dicom_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    /// Series directory names under `RAW/DICOM`, sorted by series number
    pub fn series_dir_names(&self) -> Vec<String> {
        let mut names = list_subdirectories(&self.dicom_dir()).unwrap_or_default();
        names.sort_by_key(|name| (series_number_from_dir_name(name), name.clone()));
        names
    }

    /// Numbers of cached series whose description contains `description`,
    /// ignoring case
    pub fn series_numbers_matching(&self, description: &str) -> Vec<i64> {
        let needle = description.to_lowercase();
        let Ok(record) = self.read_meta("") else {
            return Vec::new();
        };
        record
            .series()
            .iter()
            .filter(|s| s.series_description.to_lowercase().contains(&needle))
            .filter_map(|s| s.series_number)
            .collect()
    }

    /// Write `META/ScanSeriesInfo.csv` from the cached series list
    pub fn build_series_meta_csv(&self) -> Result<PathBuf> {
        let record = self.read_meta("")?;
        let series = record.series();

        let extra: BTreeSet<&str> = series
            .iter()
            .flat_map(|s| s.tags.keys().map(String::as_str))
            .collect();
        let mut header = vec!["SeriesNumber", "SeriesDescription", "ImageCount"];
        header.extend(extra.iter().copied());

        let rows: Vec<Vec<String>> = series
            .iter()
            .map(|s| {
                let mut row = vec![
                    s.series_number.map(|n| n.to_string()).unwrap_or_default(),
                    s.series_description.clone(),
                    s.image_count.to_string(),
                ];
                row.extend(extra.iter().map(|k| s.tags.get(*k).cloned().unwrap_or_default()));
                row
            })
            .collect();

        let path = self.series_csv_file();
        structure::resolve_subdir(self, &[META_DIR], true)?;
        report::write_csv(&path, &header, &rows)?;
        self.log(Level::Info, "buildSeriesDataMetaCSV")?;
        Ok(path)
    }

    // -- Reporting --

    /// Age in years at the study date (365-day years)
    pub fn age(&self) -> Option<f64> {
        let record = self.read_meta("").ok()?;
        let birth = parse_dicom_date(&record.get_str(tags::PATIENT_BIRTH_DATE)?)?;
        let study = parse_dicom_date(&record.get_str(tags::STUDY_DATE)?)?;
        Some((study - birth).num_days() as f64 / 365.0)
    }

    /// `(key, value)` pairs for [`INFO_KEYS`] plus `Age`
    pub fn info(&self) -> Vec<(String, String)> {
        let record = self.read_meta("").unwrap_or_default();
        let mut out: Vec<(String, String)> = INFO_KEYS
            .iter()
            .map(|key| {
                let value = record.get_str(key).unwrap_or_else(|| UNKNOWN.to_string());
                (key.to_string(), value)
            })
            .collect();
        out.push(("Age".to_string(), self.age_text()));
        out
    }

    /// Every cached tag as text, a `Series <n>` entry per series, then `Age`
    pub fn info_full(&self) -> Result<Vec<(String, String)>> {
        let record = self.read_meta("")?;
        let mut out: Vec<(String, String)> = record
            .tags
            .iter()
            .map(|(key, value)| {
                let text = record.get_str(key).unwrap_or_else(|| value.to_string());
                (key.clone(), text)
            })
            .collect();
        for series in record.series() {
            let number = series
                .series_number
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string());
            out.push((
                format!("Series {}", number),
                format!("{} ({} images)", series.series_description, series.image_count),
            ));
        }
        out.push(("Age".to_string(), self.age_text()));
        Ok(out)
    }

    fn age_text(&self) -> String {
        self.age()
            .map(|a| format!("{:5.2}", a))
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    pub fn summary_row(&self) -> SummaryRow {
        let record = self.read_meta("").unwrap_or_default();
        let text = |tag: &str| record.get_str(tag).unwrap_or_else(|| UNKNOWN.to_string());
        SummaryRow {
            subject_id: self.id.canonical(),
            patient_id: text(tags::PATIENT_ID),
            gender: text(tags::PATIENT_SEX),
            study_date: text(tags::STUDY_DATE),
            number_of_series: record.series().len(),
            series_descriptions: self.series_dir_names().join(","),
        }
    }

    // -- Whole-subject operations --

    /// Move the subject to `new_id` under the same root. The ID-named META
    /// files follow; other contents are untouched.
    pub fn rename(&self, new_id: SubjectId) -> Result<Subject> {
        if !self.exists() {
            return Err(Error::Structure(self.top_dir()));
        }
        let renamed = Subject {
            id: new_id,
            root: self.root.clone(),
            tree: self.tree.clone(),
        };
        let dest = renamed.top_dir();
        if dest.exists() {
            return Err(Error::Conflict(dest));
        }

        let old = self.id.canonical();
        let new = renamed.id.canonical();
        fs::rename(self.top_dir(), &dest)?;

        // A half-renamed subject is worse than none
        if let Err(e) = rename_meta_files(&renamed.meta_dir(), &old, &new) {
            if let Err(undo) = fs::rename(&dest, self.top_dir()) {
                log_file_error(&dest, "rename back", &undo);
            }
            return Err(e);
        }
        log_fs_modification("rename_subject", &dest, Some(&old));

        renamed.log(Level::Info, &format!("Renamed from {} to {}", old, new))?;
        Ok(renamed)
    }

    /// Write `<dir>/<ID>.tar` holding the subject tree, optionally without
    /// the `RAW` directory
    pub fn archive_to(&self, dir: &Path, exclude_raw: bool) -> Result<PathBuf> {
        if !self.exists() {
            return Err(Error::Structure(self.top_dir()));
        }
        fs::create_dir_all(dir)?;

        let id = self.id.canonical();
        let archive_path = dir.join(format!("{}.tar", id));
        let mut builder = tar::Builder::new(File::create(&archive_path)?);

        if exclude_raw {
            for name in list_top_entries(&self.top_dir())? {
                if name == RAW_DIR {
                    continue;
                }
                let path = self.top_dir().join(&name);
                let in_archive = Path::new(&id).join(&name);
                if path.is_dir() {
                    builder.append_dir_all(&in_archive, &path)?;
                } else {
                    builder.append_path_with_name(&path, &in_archive)?;
                }
            }
        } else {
            builder.append_dir_all(&id, self.top_dir())?;
        }
        builder.finish()?;

        log_fs_modification("archive_subject", &archive_path, None);
        self.log(
            Level::Info,
            &format!("Archived subject to {}", archive_path.display()),
        )?;
        Ok(archive_path)
    }
}

/// Rename the ID-named files in `meta_dir`, undoing the ones already done
/// when one fails
fn rename_meta_files(meta_dir: &Path, old: &str, new: &str) -> Result<()> {
    if !meta_dir.is_dir() {
        return Ok(());
    }
    let mut done: Vec<(PathBuf, PathBuf)> = Vec::new();
    for name in list_top_entries(meta_dir)? {
        let Some(new_name) = renamed_meta_file(&name, old, new) else {
            continue;
        };
        let from = meta_dir.join(&name);
        let to = meta_dir.join(&new_name);
        let result = if to.exists() {
            Err(Error::Conflict(to.clone()))
        } else {
            fs::rename(&from, &to).map_err(Error::from)
        };
        if let Err(e) = result {
            for (from, to) in done.iter().rev() {
                if let Err(undo) = fs::rename(to, from) {
                    log_file_error(to, "rename back", &undo);
                }
            }
            return Err(e);
        }
        done.push((from, to));
    }
    Ok(())
}

fn renamed_meta_file(name: &str, old: &str, new: &str) -> Option<String> {
    if name == format!("{}.log", old) {
        return Some(format!("{}.log", new));
    }
    let rest = name.strip_prefix(old)?.strip_prefix("Tags")?;
    rest.ends_with(".json").then(|| format!("{}Tags{}", new, rest))
}

fn list_top_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

pub fn parse_dicom_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), DICOM_DATE_FORMAT).ok()
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl PartialEq for Subject {
    fn eq(&self, other: &Self) -> bool {
        self.id.canonical() == other.id.canonical() && self.root == other.root
    }
}

impl Eq for Subject {}

impl Hash for Subject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.canonical().hash(state);
        self.root.hash(state);
    }
}

impl Ord for Subject {
    fn cmp(&self, other: &Self) -> Ordering {
        // Opaque IDs (no number) sort after numbered ones
        let key = |s: &Subject| (s.id.number().is_none(), s.id.number());
        key(self)
            .cmp(&key(other))
            .then_with(|| self.id.canonical().cmp(&other.id.canonical()))
            .then_with(|| self.root.cmp(&other.root))
    }
}

impl PartialOrd for Subject {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SeriesSummary;
    use crate::test_utils::{write_fake_study, FakeDicom};
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn subject(root: &Path, number: u64) -> Subject {
        Subject::new(SubjectId::new("MI", number, 6), root)
    }

    #[test]
    fn test_paths_are_derived() {
        let s = subject(Path::new("/data"), 1);
        assert_eq!(s.top_dir(), PathBuf::from("/data/MI000001"));
        assert_eq!(s.dicom_dir(), PathBuf::from("/data/MI000001/RAW/DICOM"));
        assert_eq!(s.meta_tags_file("_ANON"), PathBuf::from("/data/MI000001/META/MI000001Tags_ANON.json"));
        assert_eq!(s.log_file(), PathBuf::from("/data/MI000001/META/MI000001.log"));
    }

    #[test]
    fn test_construction_does_not_touch_disk() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        assert!(!s.exists());
        assert_eq!(s.state(), SubjectState::Unmaterialized);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_equality_and_hash() {
        let a = subject(Path::new("/data"), 1);
        let b = Subject::new(SubjectId::parse("MI000001").unwrap(), "/data");
        let c = subject(Path::new("/other"), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Subject> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_ordering_is_numeric() {
        let mut subjects = vec![
            Subject::new(SubjectId::opaque("MySpecialID"), "/data"),
            subject(Path::new("/data"), 10),
            Subject::new(SubjectId::new("MI", 2, 3), "/data"),
            subject(Path::new("/data"), 1),
        ];
        subjects.sort();
        let ids: Vec<String> = subjects.iter().map(|s| s.to_string()).collect();
        assert_eq!(ids, vec!["MI000001", "MI002", "MI000010", "MySpecialID"]);
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_fake_study(source.path(), "1.2.3", "ABC", &[(1, "Localiser", 2)]);

        let s = subject(dir.path(), 1);
        s.ensure_structure().unwrap();
        assert_eq!(s.state(), SubjectState::Materialized);

        s.load_dicoms(source.path(), &FakeDicom, None).unwrap();
        assert_eq!(s.state(), SubjectState::Populated);

        s.set_archived().unwrap();
        assert!(s.is_archived());
        assert_eq!(s.state(), SubjectState::Archived);
    }

    #[test]
    fn test_load_dicoms_caches_tags_and_series() {
        let dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_fake_study(source.path(), "1.2.3", "ABC", &[(1, "Localiser", 2), (41, "RVLA cine", 3)]);

        let s = subject(dir.path(), 1);
        assert_eq!(s.load_dicoms(source.path(), &FakeDicom, None).unwrap(), 5);
        assert_eq!(s.count_dicoms(), 5);
        assert_eq!(s.tag_str("PatientID").as_deref(), Some("ABC"));
        assert_eq!(s.tag_str("StudyInstanceUID").as_deref(), Some("1.2.3"));
        assert_eq!(s.series_numbers_matching("rvla"), vec![41]);
        assert_eq!(s.series_dir_names(), vec!["SE1_Localiser", "SE41_RVLA_cine"]);

        let log = fs::read_to_string(s.log_file()).unwrap();
        assert!(log.contains("|INFO|Loaded 5 DICOM files"));
    }

    #[test]
    fn test_load_missing_source() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        let result = s.load_dicoms(&dir.path().join("absent"), &FakeDicom, None);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_anonymise_is_repeatable() {
        let dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_fake_study(source.path(), "1.2.3", "ABC", &[(1, "Localiser", 2)]);
        let s = subject(dir.path(), 1);
        s.load_dicoms(source.path(), &FakeDicom, None).unwrap();

        assert_eq!(s.anonymise("Anon", &FakeDicom).unwrap(), 2);
        let first = s.read_meta("").unwrap();
        assert_eq!(s.anonymise("Anon", &FakeDicom).unwrap(), 2);
        let second = s.read_meta("").unwrap();

        assert_eq!(first, second);
        assert_eq!(s.tag_str("PatientName").as_deref(), Some("Anon"));
    }

    #[test]
    fn test_anonymise_missing_subject() {
        let dir = tempdir().unwrap();
        let result = subject(dir.path(), 3).anonymise("Anon", &FakeDicom);
        assert!(matches!(result, Err(Error::Structure(_))));
    }

    #[test]
    fn test_study_id_falls_back_to_scanner_id() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        s.ensure_structure().unwrap();
        assert_eq!(s.study_id(), None);

        s.set_tag("StudyID", "0").unwrap();
        assert_eq!(s.study_id().as_deref(), Some("0"));
        s.set_tag("ScannerStudyID", "5512").unwrap();
        assert_eq!(s.study_id().as_deref(), Some("5512"));
        s.set_tag("StudyID", "17").unwrap();
        assert_eq!(s.study_id().as_deref(), Some("17"));
    }

    #[test]
    fn test_info_and_age() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        s.ensure_structure().unwrap();
        assert_eq!(s.age(), None);

        s.update_meta(
            MetadataRecord::new()
                .with_tag("PatientBirthDate", "19800101")
                .with_tag("StudyDate", "20100101"),
            "",
        )
        .unwrap();
        let age = s.age().unwrap();
        assert!((age - 30.0219).abs() < 0.001, "age was {}", age);

        let info = s.info();
        assert_eq!(info.len(), INFO_KEYS.len() + 1);
        assert_eq!(info[0], ("PatientBirthDate".to_string(), "19800101".to_string()));
        assert_eq!(info[1], ("PatientID".to_string(), "Unknown".to_string()));
        assert_eq!(info[8], ("Consent".to_string(), "Unknown".to_string()));
        assert_eq!(info.last().unwrap(), &("Age".to_string(), "30.02".to_string()));
    }

    #[test]
    fn test_info_full_lists_every_tag() {
        let dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_fake_study(source.path(), "1.2.3", "ABC", &[(1, "Localiser", 2)]);
        let s = subject(dir.path(), 1);
        s.load_dicoms(source.path(), &FakeDicom, None).unwrap();
        s.set_tag("Consent", "Yes").unwrap();
        s.set_tag("PatientWeight", 80).unwrap();

        let info = s.info_full().unwrap();
        let value = |key: &str| info.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        assert_eq!(value("Consent").as_deref(), Some("Yes"));
        assert_eq!(value("PatientWeight").as_deref(), Some("80"));
        assert_eq!(value("StudyInstanceUID").as_deref(), Some("1.2.3"));
        assert_eq!(value("Series 1").as_deref(), Some("Localiser (2 images)"));
        assert_eq!(info.last().unwrap().0, "Age");
    }

    #[test]
    fn test_summary_row() {
        let dir = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_fake_study(source.path(), "1.2.3", "ABC", &[(1, "Localiser", 1), (2, "Cine", 1)]);
        let s = subject(dir.path(), 1);
        s.load_dicoms(source.path(), &FakeDicom, None).unwrap();
        s.set_tag("PatientSex", "F").unwrap();

        let row = s.summary_row();
        assert_eq!(row.subject_id, "MI000001");
        assert_eq!(row.patient_id, "ABC");
        assert_eq!(row.gender, "F");
        assert_eq!(row.number_of_series, 2);
        assert_eq!(row.series_descriptions, "SE1_Localiser,SE2_Cine");
    }

    #[test]
    fn test_build_series_meta_csv() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        s.ensure_structure().unwrap();
        let series = vec![SeriesSummary {
            series_number: Some(3),
            series_description: "T1 map, post".to_string(),
            image_count: 11,
            tags: [("EchoTime".to_string(), "1.1".to_string())].into_iter().collect(),
        }];
        s.update_meta(MetadataRecord::new().with_series(series), "").unwrap();

        let path = s.build_series_meta_csv().unwrap();
        assert_eq!(path, dir.path().join("MI000001/META/ScanSeriesInfo.csv"));
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(
            content,
            "SeriesNumber,SeriesDescription,ImageCount,EchoTime\n3,\"T1 map, post\",11,1.1\n"
        );
    }

    #[test]
    fn test_rename_moves_meta_files() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        s.ensure_structure().unwrap();
        s.set_tag("PatientID", "ABC").unwrap();
        s.update_meta(MetadataRecord::new().with_tag("PatientName", "Anon"), "_ANON").unwrap();

        let renamed = s.rename(SubjectId::opaque("MySpecialID")).unwrap();
        assert!(!dir.path().join("MI000001").exists());
        assert!(renamed.exists());
        assert!(dir.path().join("MySpecialID/META/MySpecialIDTags.json").is_file());
        assert!(dir.path().join("MySpecialID/META/MySpecialIDTags_ANON.json").is_file());
        assert!(dir.path().join("MySpecialID/META/MySpecialID.log").is_file());
        assert_eq!(renamed.tag_str("PatientID").as_deref(), Some("ABC"));
    }

    #[test]
    fn test_failed_rename_is_rolled_back() {
        let dir = tempdir().unwrap();
        let s = subject(dir.path(), 1);
        s.ensure_structure().unwrap();
        s.set_tag("PatientID", "ABC").unwrap();
        // Stray file that blocks the metadata file rename
        fs::write(s.meta_dir().join("MI000002Tags.json"), "{}").unwrap();

        let result = s.rename(SubjectId::new("MI", 2, 6));
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(!dir.path().join("MI000002").exists());
        assert!(s.exists());
        assert!(s.meta_tags_file("").is_file());
        assert!(s.log_file().is_file());
        assert!(!s.meta_dir().join("MI000002.log").exists());
        assert_eq!(s.tag_str("PatientID").as_deref(), Some("ABC"));
    }

    #[test]
    fn test_rename_conflict_and_missing() {
        let dir = tempdir().unwrap();
        let one = subject(dir.path(), 1);
        let two = subject(dir.path(), 2);
        one.ensure_structure().unwrap();
        two.ensure_structure().unwrap();

        let result = one.rename(two.id().clone());
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert!(one.exists());

        let ghost = subject(dir.path(), 9);
        let result = ghost.rename(SubjectId::new("MI", 10, 6));
        assert!(matches!(result, Err(Error::Structure(_))));
    }

    #[test]
    fn test_archive_to() {
        let dir = tempdir().unwrap();
        let out = tempdir().unwrap();
        let source = tempdir().unwrap();
        write_fake_study(source.path(), "1.2.3", "ABC", &[(1, "Localiser", 2)]);
        let s = subject(dir.path(), 1);
        s.load_dicoms(source.path(), &FakeDicom, None).unwrap();

        let entries = |path: &Path| -> Vec<String> {
            let mut archive = tar::Archive::new(File::open(path).unwrap());
            archive
                .entries()
                .unwrap()
                .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
                .collect()
        };

        let full = s.archive_to(out.path(), false).unwrap();
        let names = entries(&full);
        assert!(names.iter().any(|n| n == "MI000001/META/MI000001Tags.json"));
        assert!(names.iter().any(|n| n.starts_with("MI000001/RAW/DICOM/SE1_Localiser/")));

        fs::remove_file(&full).unwrap();
        let slim = s.archive_to(out.path(), true).unwrap();
        let names = entries(&slim);
        assert!(names.iter().any(|n| n == "MI000001/META/MI000001Tags.json"));
        assert!(!names.iter().any(|n| n.contains("RAW")));
    }
}

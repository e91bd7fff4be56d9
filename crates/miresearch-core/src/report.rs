//! Tabular output: summary rows and CSV files.

use serde::Serialize;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;

/// Written when a tag is not known for a subject
pub const UNKNOWN: &str = "Unknown";

/// Columns of the subject summary, in order
pub const SUMMARY_HEADER: [&str; 6] = [
    "SubjectID",
    "PatientID",
    "Gender",
    "StudyDate",
    "NumberOfSeries",
    "SERIES_DESCRIPTIONS",
];

/// One subject's summary line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SummaryRow {
    #[serde(rename = "SubjectID")]
    pub subject_id: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    pub gender: String,
    pub study_date: String,
    pub number_of_series: usize,
    #[serde(rename = "SERIES_DESCRIPTIONS")]
    pub series_descriptions: String,
}

impl SummaryRow {
    /// Values in [`SUMMARY_HEADER`] order
    pub fn fields(&self) -> Vec<String> {
        vec![
            self.subject_id.clone(),
            self.patient_id.clone(),
            self.gender.clone(),
            self.study_date.clone(),
            self.number_of_series.to_string(),
            self.series_descriptions.clone(),
        ]
    }
}

/// Quote a field when it contains a separator, quote or line break
pub fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

pub fn format_row<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Write a header line followed by `rows`, replacing any existing file
pub fn write_csv<H, R>(path: &Path, header: &[H], rows: &[Vec<R>]) -> Result<()>
where
    H: AsRef<str>,
    R: AsRef<str>,
{
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", format_row(header))?;
    for row in rows {
        writeln!(out, "{}", format_row(row))?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("MI000001"), "MI000001");
        assert_eq!(escape_field("SE1_Loc,SE2_Cine"), "\"SE1_Loc,SE2_Cine\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_write_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let rows = vec![vec!["a".to_string(), "b,c".to_string()]];
        write_csv(&path, &["X", "Y"], &rows).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "X,Y\na,\"b,c\"\n");
    }
}

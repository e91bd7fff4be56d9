//! Subject identifiers.
//!
//! A subject ID is `prefix + zero-padded number + suffix`, e.g. `MI000042` or
//! `TMP000001_NN`. IDs that carry no number at all (e.g. `MySpecialID`) are
//! *opaque*: they can be constructed explicitly but are never produced by
//! decoding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::structure::list_subdirectories;

/// Default number of digits in a subject number
pub const DEFAULT_PAD_WIDTH: usize = 6;

/// Structured form of a subject ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectId {
    prefix: String,
    number: Option<u64>,
    pad_width: usize,
    suffix: String,
}

/// Borrowed pieces of an ID string
struct IdParts<'a> {
    prefix: &'a str,
    digits: &'a str,
    suffix: &'a str,
}

/// Zero-pad `number` to `pad_width` digits and wrap it in prefix and suffix.
///
/// Numbers wider than `pad_width` are written in full.
pub fn encode(number: u64, prefix: &str, pad_width: usize, suffix: &str) -> String {
    format!("{prefix}{number:0width$}{suffix}", width = pad_width)
}

/// Split an ID that ends in a digit run into `(prefix, number)`.
pub fn decode(id: &str) -> Result<(String, u64)> {
    let parts = split(id)?;
    if !parts.suffix.is_empty() {
        return Err(Error::format(
            id,
            "digit run is followed by trailing characters",
        ));
    }
    let number = parse_number(id, parts.digits)?;
    Ok((parts.prefix.to_string(), number))
}

/// Guess the subject prefix used under `root` by majority vote.
pub fn guess_prefix(root: &Path) -> Result<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for name in list_subdirectories(root)? {
        if let Ok(id) = SubjectId::parse(&name) {
            *counts.entry(id.prefix).or_default() += 1;
        }
    }

    let Some(top) = counts.values().copied().max() else {
        return Err(Error::AmbiguousPrefix {
            root: root.to_path_buf(),
            reason: "no subject directories found".to_string(),
        });
    };

    let mut winners: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count == top)
        .map(|(prefix, _)| prefix)
        .collect();

    if winners.len() > 1 {
        winners.sort();
        return Err(Error::AmbiguousPrefix {
            root: root.to_path_buf(),
            reason: format!("prefixes {:?} tie with {} subjects each", winners, top),
        });
    }

    Ok(winners.remove(0))
}

fn split(id: &str) -> Result<IdParts<'_>> {
    let digits_start = id
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| Error::format(id, "no digits found"))?;
    let rest = &id[digits_start..];
    let digits_len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, suffix) = rest.split_at(digits_len);

    if suffix.chars().any(|c| c.is_ascii_digit()) {
        return Err(Error::format(id, "digits embedded in trailing characters"));
    }

    Ok(IdParts {
        prefix: &id[..digits_start],
        digits,
        suffix,
    })
}

fn parse_number(id: &str, digits: &str) -> Result<u64> {
    digits
        .parse::<u64>()
        .map_err(|e| Error::format(id, format!("subject number out of range: {}", e)))
}

impl SubjectId {
    /// Create a numbered ID with no suffix
    pub fn new(prefix: impl Into<String>, number: u64, pad_width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            number: Some(number),
            pad_width,
            suffix: String::new(),
        }
    }

    /// Attach a suffix (e.g. `_NN`)
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    /// Create an ID with no number; the whole string is kept as-is
    pub fn opaque(id: impl Into<String>) -> Self {
        Self {
            prefix: id.into(),
            number: None,
            pad_width: 0,
            suffix: String::new(),
        }
    }

    /// Parse a canonical ID. A trailing suffix without digits is allowed and
    /// the pad width is taken from the length of the digit run.
    pub fn parse(id: &str) -> Result<Self> {
        let parts = split(id)?;
        let number = parse_number(id, parts.digits)?;
        Ok(Self {
            prefix: parts.prefix.to_string(),
            number: Some(number),
            pad_width: parts.digits.len(),
            suffix: parts.suffix.to_string(),
        })
    }

    /// Parse a canonical ID, falling back to an opaque ID
    pub fn parse_or_opaque(id: &str) -> Self {
        Self::parse(id).unwrap_or_else(|_| Self::opaque(id))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn number(&self) -> Option<u64> {
        self.number
    }

    pub fn pad_width(&self) -> usize {
        self.pad_width
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn is_opaque(&self) -> bool {
        self.number.is_none()
    }

    /// The on-disk directory name
    pub fn canonical(&self) -> String {
        match self.number {
            Some(number) => encode(number, &self.prefix, self.pad_width, &self.suffix),
            None => format!("{}{}", self.prefix, self.suffix),
        }
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for SubjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// -- Tests --

//! Next-free subject number allocation.
//!
//! Allocation is a scan of the root directory and is not atomic. Two callers
//! may compute the same number; the exclusive create in
//! [`crate::structure::create_new`] is what turns that into a `Conflict`.

use log::debug;
use std::path::Path;

use crate::error::{Error, Result};
use crate::structure::list_subdirectories;

/// Number handed out when no subject with the prefix exists yet
pub const FIRST_SUBJECT_NUMBER: u64 = 1;

/// Return one past the highest number used under `prefix` in `root`.
///
/// Directory names must be `prefix` followed directly by a digit run; any
/// trailing suffix (e.g. `_NN`) is ignored. A missing root counts as empty.
pub fn next_number(root: &Path, prefix: &str) -> Result<u64> {
    if !root.is_dir() {
        return Ok(FIRST_SUBJECT_NUMBER);
    }

    let highest = list_subdirectories(root)?
        .iter()
        .filter_map(|name| number_after_prefix(name, prefix))
        .max();

    let next = match highest {
        None => FIRST_SUBJECT_NUMBER,
        Some(n) => n
            .checked_add(1)
            .ok_or_else(|| Error::format(&format!("{}{}", prefix, n), "no subject number left after it"))?,
    };
    debug!(
        "Next subject number for prefix '{}' in {}: {}",
        prefix,
        root.display(),
        next
    );
    Ok(next)
}

fn number_after_prefix(name: &str, prefix: &str) -> Option<u64> {
    let rest = name.strip_prefix(prefix)?;
    let digits_len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_len == 0 {
        return None;
    }
    rest[..digits_len].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_empty_root_starts_at_one() {
        let dir = tempdir().unwrap();
        assert_eq!(next_number(dir.path(), "MI").unwrap(), 1);
    }

    #[test]
    fn test_missing_root_starts_at_one() {
        let dir = tempdir().unwrap();
        assert_eq!(next_number(&dir.path().join("absent"), "MI").unwrap(), 1);
    }

    #[test]
    fn test_next_after_existing() {
        let dir = tempdir().unwrap();
        for name in ["MI000001", "MI000002", "MI000003"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(next_number(dir.path(), "MI").unwrap(), 4);
    }

    #[test]
    fn test_ignores_other_prefixes_and_suffixes() {
        let dir = tempdir().unwrap();
        for name in ["TMP000001_NN", "OTHER007", "MIV000010", "TMP"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(next_number(dir.path(), "TMP").unwrap(), 2);
        assert_eq!(next_number(dir.path(), "MI").unwrap(), 1);
    }

    #[test]
    fn test_gaps_do_not_get_reused() {
        let dir = tempdir().unwrap();
        for name in ["MI000001", "MI000009"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        assert_eq!(next_number(dir.path(), "MI").unwrap(), 10);
    }

    #[test]
    fn test_largest_number_cannot_be_followed() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(format!("MI{}", u64::MAX))).unwrap();
        assert!(matches!(
            next_number(dir.path(), "MI"),
            Err(Error::Format { .. })
        ));
    }
}

//! Firmware version strings such as `23.4R2.13` or `21.4R3-S5`.

use std::cmp::Ordering;
use std::fmt;

use once_cell::sync::Lazy;
use regex_lite::Regex;

static NUMBERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// A version compared by its numeric components, left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareVersion {
    raw: String,
    parts: Vec<u64>,
}

impl FirmwareVersion {
    /// Parse a version. Returns `None` if it contains no digits.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<u64> = NUMBERS
            .find_iter(raw)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(Self {
            raw: raw.trim().to_string(),
            parts,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn major(&self) -> u64 {
        self.parts[0]
    }

    /// Catalog directory holding images of this major release.
    pub fn major_dir(&self) -> String {
        format!("{}.x", self.major())
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts
            .cmp(&other.parts)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Version embedded in an image file name.
///
/// `junos-srxsme-23.4R2.13.tgz` gives `23.4R2.13`. Vendor prefix segments are
/// skipped up to the first segment that starts with a digit and contains a
/// dot, so `...-mips-64-23.4R2.13.tgz` still gives `23.4R2.13`.
pub fn version_from_file_name(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix(".tgz").unwrap_or(file_name);
    let segments: Vec<&str> = stem.split('-').collect();
    let starts_numeric = |s: &&str| s.chars().next().is_some_and(|c| c.is_ascii_digit());

    let start = segments
        .iter()
        .position(|s| starts_numeric(s) && s.contains('.'))
        .or_else(|| segments.iter().position(|s| starts_numeric(s)))?;
    Some(segments[start..].join("-"))
}

//! File-based predicates.
//!
//! Every predicate resolves its target from its own `localPath` or the
//! owning step; with no target at all it is vacuously met.

use std::cmp::Ordering;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ConditionScope, Predicate};
use crate::attributes::Attributes;
use crate::checksum::{checksums_match, sha256_file};

/// Comparison of the local artifact against the declared value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComparisonType {
    /// Local is greater / newer
    Above,
    Is,
    /// Local is smaller / older. A missing file always counts as below.
    #[default]
    Below,
}

impl ComparisonType {
    fn from_attr(value: Option<&str>) -> Option<Self> {
        match value?.trim().to_ascii_lowercase().as_str() {
            "above" | "newer" | "greater" => Some(ComparisonType::Above),
            "is" | "equals" => Some(ComparisonType::Is),
            "below" | "older" | "smaller" => Some(ComparisonType::Below),
            _ => None,
        }
    }

    /// Compare `local` against the declared value.
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            ComparisonType::Above => ordering == Ordering::Greater,
            ComparisonType::Is => ordering == Ordering::Equal,
            ComparisonType::Below => ordering == Ordering::Less,
        }
    }

    fn missing_file(self) -> bool {
        self == ComparisonType::Below
    }
}

fn comparison(attrs: &Attributes) -> ComparisonType {
    ComparisonType::from_attr(attrs.get("what")).unwrap_or_default()
}

/// Met when the target exists
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileExistsCondition {
    pub local_path: Option<String>,
}

impl FileExistsCondition {
    pub fn new(local_path: Option<String>) -> Self {
        Self { local_path }
    }

    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self::new(attrs.string("localPath"))
    }
}

impl Predicate for FileExistsCondition {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        match scope.target(self.local_path.as_deref()) {
            Some(path) => path.exists(),
            None => true,
        }
    }
}

/// Met when the target's SHA-256 equals `checksum`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileChecksumCondition {
    pub local_path: Option<String>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
}

impl FileChecksumCondition {
    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            local_path: attrs.string("localPath"),
            checksum: attrs.string("checksum"),
            checksum_type: attrs.string("checksumType"),
        }
    }
}

impl Predicate for FileChecksumCondition {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        let Some(path) = scope.target(self.local_path.as_deref()) else {
            return true;
        };
        if !path.is_file() {
            return false;
        }

        let kind = self.checksum_type.as_deref().unwrap_or("sha256");
        if !kind.eq_ignore_ascii_case("sha256") {
            warn!(checksum_type = %kind, "Unsupported checksum type");
            return false;
        }

        let Some(expected) = self.checksum.as_deref() else {
            return false;
        };

        match sha256_file(&path) {
            Ok(actual) => checksums_match(expected, &actual),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to hash file");
                false
            }
        }
    }
}

/// Compares the target's size in bytes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileSizeCondition {
    pub local_path: Option<String>,
    pub size: u64,
    pub what: ComparisonType,
}

impl FileSizeCondition {
    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            local_path: attrs.string("localPath"),
            size: attrs.parse("size").unwrap_or(0),
            what: comparison(attrs),
        }
    }
}

impl Predicate for FileSizeCondition {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        let Some(path) = scope.target(self.local_path.as_deref()) else {
            return true;
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => self.what.holds(meta.len().cmp(&self.size)),
            _ => self.what.missing_file(),
        }
    }
}

/// Compares the target's version, read from a `<file>.version` sidecar
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileVersionCondition {
    pub local_path: Option<String>,
    pub version: String,
    pub what: ComparisonType,
}

impl FileVersionCondition {
    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            local_path: attrs.string("localPath"),
            version: attrs.string("version").unwrap_or_default(),
            what: comparison(attrs),
        }
    }
}

impl Predicate for FileVersionCondition {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        let Some(path) = scope.target(self.local_path.as_deref()) else {
            return true;
        };
        if !path.is_file() {
            return self.what.missing_file();
        }

        let local = read_version(&path);
        self.what.holds(compare_versions(&local, &self.version))
    }
}

/// Version recorded next to a file; `0` when there is none.
pub(crate) fn read_version(path: &Path) -> String {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".version");

    std::fs::read_to_string(&sidecar)
        .ok()
        .and_then(|text| text.lines().next().map(|l| l.trim().to_string()))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "0".to_string())
}

/// Compare dotted numeric versions; missing or non-numeric parts count as 0.
pub(crate) fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches(|c: char| c == 'v' || c == 'V')
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };

    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Compares the target's modification time, to the second
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileDateCondition {
    pub local_path: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub what: ComparisonType,
}

impl FileDateCondition {
    pub fn from_attributes(attrs: &Attributes) -> Self {
        Self {
            local_path: attrs.string("localPath"),
            timestamp: attrs.timestamp("timestamp"),
            what: comparison(attrs),
        }
    }
}

impl Predicate for FileDateCondition {
    fn is_met(&self, scope: &ConditionScope<'_>) -> bool {
        let Some(path) = scope.target(self.local_path.as_deref()) else {
            return true;
        };
        let Some(declared) = self.timestamp else {
            return true;
        };

        let modified = std::fs::metadata(&path)
            .ok()
            .filter(|m| m.is_file())
            .and_then(|m| m.modified().ok());

        match modified {
            Some(modified) => {
                let local: DateTime<Utc> = modified.into();
                self.what.holds(local.timestamp().cmp(&declared.timestamp()))
            }
            None => self.what.missing_file(),
        }
    }
}

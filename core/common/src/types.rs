//! Common types used throughout Lexideck storage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters the remote backend refuses in item names.
const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Canonicalize a caller-supplied path.
///
/// Backslashes become forward slashes, a leading drive letter (`C:`) is
/// dropped, surrounding slashes and whitespace are trimmed, and characters
/// the remote cannot store are replaced with `_`. Applying it twice gives
/// the same result as applying it once.
pub fn normalize(raw: &str) -> String {
    let forward = raw.replace('\\', "/");
    let trimmed = forward.trim();
    let without_drive = strip_drive_letter(trimmed);
    let bare = without_drive.trim_matches(|c: char| c == '/' || c.is_whitespace());

    bare.chars()
        .map(|c| {
            if ILLEGAL_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn strip_drive_letter(path: &str) -> &str {
    let mut chars = path.chars();
    match (chars.next(), chars.next()) {
        (Some(letter), Some(':')) if letter.is_ascii_alphabetic() => &path[2..],
        _ => path,
    }
}

/// A normalized, slash-separated logical path.
///
/// This is the virtual path callers use for both backends, not a physical
/// filesystem path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LogicalPath(String);

impl LogicalPath {
    /// The empty path, which resolves to the storage root.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Normalize and wrap a raw path. Never fails.
    pub fn parse(raw: &str) -> Self {
        Self(normalize(raw))
    }

    /// Non-empty segments, skipping `.` placeholders.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty() && *s != ".")
    }

    /// Check if this path resolves to the root.
    pub fn is_root(&self) -> bool {
        self.segments().next().is_none()
    }

    /// Append another path below this one.
    pub fn join(&self, child: &LogicalPath) -> Self {
        match (self.is_root(), child.is_root()) {
            (true, _) => child.clone(),
            (_, true) => self.clone(),
            _ => Self(format!("{}/{}", self.0, child.0)),
        }
    }

    /// Split into the parent path and the final segment.
    ///
    /// Returns `None` for the root.
    pub fn split_last(&self) -> Option<(LogicalPath, &str)> {
        let segments: Vec<&str> = self.segments().collect();
        let (last, parents) = segments.split_last()?;
        Some((Self(parents.join("/")), last))
    }

    /// Final segment, if any.
    pub fn name(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Get the normalized string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for LogicalPath {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<LogicalPath> for String {
    fn from(path: LogicalPath) -> Self {
        path.0
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// Opaque identifier the remote assigns to a folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier the remote assigns to a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

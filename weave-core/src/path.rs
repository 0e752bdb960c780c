//! Hierarchical paths in the federated namespace and inside sources.
//!
//! A [`Path`] is always absolute. Segments may be `.` or `..`: rule
//! translation carries them across verbatim and only then normalizes, so a
//! path that climbs above its mount point can be detected and rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PathError;

const SELF_SEGMENT: &str = ".";
const PARENT_SEGMENT: &str = "..";

/// Absolute, slash-separated path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// The root path `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse an absolute path such as `/a/b`.
    ///
    /// Repeated and trailing slashes are tolerated; segments are taken
    /// verbatim (including `.` and `..`).
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        if !trimmed.starts_with('/') {
            return Err(PathError::NotAbsolute {
                text: trimmed.to_string(),
            });
        }
        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            if raw.is_empty() {
                continue;
            }
            Self::check_segment(raw)?;
            segments.push(raw.to_string());
        }
        Ok(Self { segments })
    }

    /// Build a path from already-split segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut collected = Vec::new();
        for segment in segments {
            let segment = segment.into();
            Self::check_segment(&segment)?;
            collected.push(segment);
        }
        Ok(Self {
            segments: collected,
        })
    }

    fn check_segment(segment: &str) -> Result<(), PathError> {
        if segment.is_empty() {
            return Err(PathError::InvalidSegment {
                segment: segment.to_string(),
                reason: "segment is empty".to_string(),
            });
        }
        if segment.contains('/') {
            return Err(PathError::InvalidSegment {
                segment: segment.to_string(),
                reason: "segment contains '/'".to_string(),
            });
        }
        if segment.trim() != segment {
            return Err(PathError::InvalidSegment {
                segment: segment.to_string(),
                reason: "segment has surrounding whitespace".to_string(),
            });
        }
        Ok(())
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Name of the last segment, or `None` for the root.
    pub fn last_segment(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Child path with a single appended segment.
    pub fn child(&self, name: &str) -> Result<Path, PathError> {
        Self::check_segment(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments })
    }

    /// Append relative segments verbatim.
    pub fn join(&self, relative: &[String]) -> Path {
        let mut segments = self.segments.clone();
        segments.extend(relative.iter().cloned());
        Self { segments }
    }

    /// True when `self` equals `other` or is an ancestor of it.
    pub fn is_at_or_above(&self, other: &Path) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True when `self` equals `other` or is a descendant of it.
    pub fn is_at_or_below(&self, other: &Path) -> bool {
        other.is_at_or_above(self)
    }

    /// True when `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.segments.len() < other.segments.len() && self.is_at_or_above(other)
    }

    /// Segments of `self` below `ancestor`, or `None` if `ancestor` is not at
    /// or above `self`.
    pub fn relative_to(&self, ancestor: &Path) -> Option<&[String]> {
        if ancestor.is_at_or_above(self) {
            Some(&self.segments[ancestor.segments.len()..])
        } else {
            None
        }
    }

    /// True if no `.` or `..` segments remain.
    pub fn is_normalized(&self) -> bool {
        !self
            .segments
            .iter()
            .any(|s| s == SELF_SEGMENT || s == PARENT_SEGMENT)
    }

    /// Resolve `.` and `..` segments.
    ///
    /// Returns `None` when a `..` would climb above the root.
    pub fn normalized(&self) -> Option<Path> {
        let mut segments: Vec<String> = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment.as_str() {
                SELF_SEGMENT => {}
                PARENT_SEGMENT => {
                    segments.pop()?;
                }
                _ => segments.push(segment.clone()),
            }
        }
        Some(Self { segments })
    }

    /// Every ancestor from the root down to (excluding) `self`.
    pub fn ancestors(&self) -> Vec<Path> {
        (0..self.segments.len())
            .map(|depth| Self {
                segments: self.segments[..depth].to_vec(),
            })
            .collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

//! Relative path handling
//!
//! Every path that crosses a component boundary is a [`RelativePath`]:
//! forward-slash separated, relative to the HQ root (locally) or to the
//! user prefix (remotely), validated once at ingress. Windows separators
//! are normalized on construction and a single leading slash is stripped;
//! traversal segments are rejected, never silently normalized.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// A validated, normalized path relative to the sync root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(raw: &str) -> Result<Self> {
        let normalized = raw.replace('\\', "/");
        let normalized = normalized.strip_prefix('/').unwrap_or(&normalized);

        if normalized.is_empty() {
            return Err(SyncError::InvalidPath {
                path: raw.to_string(),
                reason: "empty path",
            });
        }
        if normalized.starts_with('/') {
            return Err(SyncError::InvalidPath {
                path: raw.to_string(),
                reason: "absolute path",
            });
        }
        for segment in normalized.split('/') {
            if segment == ".." {
                return Err(SyncError::InvalidPath {
                    path: raw.to_string(),
                    reason: "path traversal segment",
                });
            }
            if segment.is_empty() || segment == "." {
                return Err(SyncError::InvalidPath {
                    path: raw.to_string(),
                    reason: "empty or dot segment",
                });
            }
            if segment.contains(':') {
                return Err(SyncError::InvalidPath {
                    path: raw.to_string(),
                    reason: "drive or scheme prefix",
                });
            }
        }

        Ok(Self(normalized.to_string()))
    }

    /// Derive the relative path of `absolute` under `root`.
    pub fn from_local(root: &Path, absolute: &Path) -> Result<Self> {
        let stripped = absolute.strip_prefix(root).map_err(|_| SyncError::InvalidPath {
            path: absolute.display().to_string(),
            reason: "path escapes the sync root",
        })?;

        let mut parts = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(SyncError::InvalidPath {
                        path: absolute.display().to_string(),
                        reason: "path escapes the sync root",
                    })
                }
            }
        }
        Self::new(&parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(idx) if idx > 0 => Some(&name[idx + 1..]),
            _ => None,
        }
    }

    /// Resolve against a local base directory using platform separators.
    pub fn to_local(&self, base: &Path) -> PathBuf {
        let mut out = base.to_path_buf();
        for segment in self.0.split('/') {
            out.push(segment);
        }
        out
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for RelativePath {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelativePath {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RelativePath::new(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_separators_and_leading_slash() {
        assert_eq!(RelativePath::new("docs\\notes.md").unwrap().as_str(), "docs/notes.md");
        assert_eq!(RelativePath::new("/a/b.txt").unwrap().as_str(), "a/b.txt");
    }

    #[test]
    fn rejects_traversal_and_empty() {
        assert!(RelativePath::new("../etc/passwd").is_err());
        assert!(RelativePath::new("a/../b").is_err());
        assert!(RelativePath::new("").is_err());
        assert!(RelativePath::new("//").is_err());
        assert!(RelativePath::new("a//b").is_err());
        assert!(RelativePath::new("C:/windows").is_err());
    }

    #[test]
    fn derives_from_local_root() {
        let root = Path::new("/home/user/hq");
        let abs = root.join("projects").join("plan.md");
        let rel = RelativePath::from_local(root, &abs).unwrap();
        assert_eq!(rel.as_str(), "projects/plan.md");
        assert!(RelativePath::from_local(root, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn file_name_and_extension() {
        let rel = RelativePath::new("a/b/notes.md").unwrap();
        assert_eq!(rel.file_name(), "notes.md");
        assert_eq!(rel.extension(), Some("md"));
        assert_eq!(RelativePath::new(".gitignore").unwrap().extension(), None);
    }

    #[test]
    fn serde_round_trip() {
        let rel = RelativePath::new("a/b.txt").unwrap();
        let json = serde_json::to_string(&rel).unwrap();
        assert_eq!(json, "\"a/b.txt\"");
        let back: RelativePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rel);
        assert!(serde_json::from_str::<RelativePath>("\"../x\"").is_err());
    }
}

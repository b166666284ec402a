//! Admission checks for paths arriving over the wire.
//!
//! Requests name a project root and a document path relative to it. A
//! [`PathGuard`] decides whether both are acceptable before any file is
//! touched. Deployments with stricter rules plug in their own guard via
//! [`crate::server::SyncServer::with_guard`].

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("path is required")]
    MissingPath,

    #[error("project path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("path escapes the document directory: {0}")]
    Traversal(String),

    #[error("file type not allowed: {0}")]
    DisallowedExtension(String),

    #[error("path is a directory: {0}")]
    IsDirectory(String),
}

/// A document path that passed the guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedPath {
    /// Normalized, `/`-separated path relative to the document directory.
    pub relative: String,
    /// `relative` joined onto the document directory.
    pub absolute: PathBuf,
}

pub trait PathGuard: Send + Sync {
    /// Validate a project root supplied by a client.
    fn resolve_project(&self, project_path: &str) -> Result<PathBuf, GuardError>;

    /// Validate a document path against a project's document directory.
    fn resolve(&self, base_dir: &Path, user_path: &str) -> Result<GuardedPath, GuardError>;
}

/// Default guard: absolute project roots, no traversal, and an extension
/// allow-list of text document formats.
#[derive(Debug, Clone)]
pub struct ExtensionGuard {
    allowed: Vec<String>,
}

impl Default for ExtensionGuard {
    fn default() -> Self {
        Self::new(["md", "json", "yaml", "yml"])
    }
}

impl ExtensionGuard {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed
                .into_iter()
                .map(|ext| ext.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    fn extension_allowed(&self, relative: &str) -> bool {
        Path::new(relative)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .is_some_and(|ext| self.allowed.iter().any(|a| *a == ext))
    }
}

impl PathGuard for ExtensionGuard {
    fn resolve_project(&self, project_path: &str) -> Result<PathBuf, GuardError> {
        let trimmed = project_path.trim();
        if trimmed.is_empty() {
            return Err(GuardError::MissingPath);
        }
        let path = PathBuf::from(trimmed);
        if !path.is_absolute() {
            return Err(GuardError::NotAbsolute(trimmed.to_string()));
        }
        Ok(path)
    }

    fn resolve(&self, base_dir: &Path, user_path: &str) -> Result<GuardedPath, GuardError> {
        let relative = normalize(user_path)?;
        if !self.extension_allowed(&relative) {
            return Err(GuardError::DisallowedExtension(relative));
        }
        let absolute = base_dir.join(&relative);
        if absolute.is_dir() {
            return Err(GuardError::IsDirectory(relative));
        }
        Ok(GuardedPath { relative, absolute })
    }
}

/// Normalize separators and reject anything that could leave the base.
fn normalize(user_path: &str) -> Result<String, GuardError> {
    let unified = user_path.trim().replace('\\', "/");
    let stripped = unified.trim_start_matches('/');
    if stripped.is_empty() {
        return Err(GuardError::MissingPath);
    }

    let mut parts = Vec::new();
    for component in Path::new(stripped).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(GuardError::Traversal(user_path.to_string())),
            },
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(GuardError::Traversal(user_path.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(GuardError::MissingPath);
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_separators() {
        let guard = ExtensionGuard::default();
        let base = Path::new("/nonexistent/base");
        let guarded = guard.resolve(base, "\\specs\\auth\\spec.md").unwrap();
        assert_eq!(guarded.relative, "specs/auth/spec.md");
        assert_eq!(guarded.absolute, base.join("specs/auth/spec.md"));

        let guarded = guard.resolve(base, "./specs/./a.md").unwrap();
        assert_eq!(guarded.relative, "specs/a.md");
    }

    #[test]
    fn test_rejects_traversal() {
        let guard = ExtensionGuard::default();
        let base = Path::new("/nonexistent/base");
        for path in ["../secret.md", "specs/../../x.md", "..\\x.md"] {
            assert!(
                matches!(guard.resolve(base, path), Err(GuardError::Traversal(_))),
                "{path} should be rejected"
            );
        }
    }

    #[test]
    fn test_extension_allow_list() {
        let guard = ExtensionGuard::default();
        let base = Path::new("/nonexistent/base");
        for ok in ["a.md", "b.json", "c.yaml", "d.YML"] {
            assert!(guard.resolve(base, ok).is_ok(), "{ok} should be allowed");
        }
        for bad in ["script.sh", "noext", "archive.md.tar"] {
            assert!(matches!(
                guard.resolve(base, bad),
                Err(GuardError::DisallowedExtension(_))
            ));
        }
    }

    #[test]
    fn test_custom_extensions() {
        let guard = ExtensionGuard::new([".txt"]);
        let base = Path::new("/nonexistent/base");
        assert!(guard.resolve(base, "notes.txt").is_ok());
        assert!(guard.resolve(base, "notes.md").is_err());
    }

    #[test]
    fn test_empty_paths() {
        let guard = ExtensionGuard::default();
        let base = Path::new("/nonexistent/base");
        assert_eq!(guard.resolve(base, ""), Err(GuardError::MissingPath));
        assert_eq!(guard.resolve(base, "///"), Err(GuardError::MissingPath));
        assert_eq!(guard.resolve_project("  "), Err(GuardError::MissingPath));
    }

    #[test]
    fn test_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("specs.md")).unwrap();
        let guard = ExtensionGuard::default();
        assert!(matches!(
            guard.resolve(dir.path(), "specs.md"),
            Err(GuardError::IsDirectory(_))
        ));
    }

    #[test]
    fn test_project_must_be_absolute() {
        let guard = ExtensionGuard::default();
        assert!(matches!(
            guard.resolve_project("relative/project"),
            Err(GuardError::NotAbsolute(_))
        ));
        let root = std::env::temp_dir();
        let resolved = guard.resolve_project(root.to_str().unwrap()).unwrap();
        assert_eq!(resolved, root);
    }
}

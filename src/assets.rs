//! Local static assets served by the dispatcher.

use std::io;
use std::path::{Component, Path, PathBuf};

/// The directory-browser single-page app.
pub const BROWSER_PAGE: &str = "directory-browser.html";

/// Read-only view of the asset directory.
#[derive(Debug, Clone)]
pub struct AssetRoot {
    root: PathBuf,
}

impl AssetRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a configured asset directory.
    ///
    /// Absolute paths are used as-is. Relative ones are tried against the
    /// working directory first, then next to the executable.
    pub fn resolve(configured: &str) -> Self {
        let path = Path::new(configured);
        if path.is_absolute() {
            return Self::new(path);
        }
        if let Ok(cwd) = std::env::current_dir() {
            let candidate = cwd.join(path);
            if candidate.is_dir() {
                return Self::new(candidate);
            }
        }
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(path)));
        Self::new(beside_exe.unwrap_or_else(|| path.to_path_buf()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read `relative` from the asset directory. Paths that would leave it
    /// are rejected as `NotFound`.
    pub async fn read(&self, relative: &str) -> io::Result<Vec<u8>> {
        let relative = Path::new(relative);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "asset path outside root",
            ));
        }
        tokio::fs::read(self.root.join(relative)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("relay-assets-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_read_existing_asset() {
        let dir = temp_root();
        std::fs::write(dir.join(BROWSER_PAGE), "<html></html>").unwrap();
        let assets = AssetRoot::new(&dir);
        assert_eq!(assets.read(BROWSER_PAGE).await.unwrap(), b"<html></html>");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escape() {
        let assets = AssetRoot::new(temp_root());
        let err = assets.read("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(assets.read("/etc/passwd").await.is_err());
    }

    #[test]
    fn test_resolve_absolute() {
        let dir = temp_root();
        let assets = AssetRoot::resolve(dir.to_str().unwrap());
        assert_eq!(assets.root(), dir.as_path());
    }
}

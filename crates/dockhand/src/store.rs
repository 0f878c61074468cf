//! Shared cross-package artifact store.
//!
//! The build phase publishes each package's wheel and sdist here so sibling
//! packages under validation can resolve the just-built artifact instead of
//! an upstream index. The store is keyed by package name and artifact kind;
//! writes land under per-package-unique names via temp-file-then-rename, so
//! concurrent builders never observe a half-copied file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::types::ArtifactKind;

/// Distribution filename normalization: dots and dashes in package names
/// become underscores in artifact filenames.
pub fn normalized_name(package: &str) -> String {
    package.replace(['-', '.'], "_")
}

/// Put/get artifacts by package and kind.
pub trait ArtifactStore: Send + Sync {
    /// Copy `src` into the store under its own filename.
    fn put(&self, package: &str, kind: ArtifactKind, src: &Path) -> Result<PathBuf>;

    /// Locate a previously stored artifact for `package`.
    fn get(&self, package: &str, kind: ArtifactKind) -> Result<Option<PathBuf>>;

    /// Directory handed to installers as a package index substitute.
    fn index_dir(&self) -> &Path;
}

/// Filesystem-backed store over one shared dist directory.
#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    dist_dir: PathBuf,
}

impl DirArtifactStore {
    pub fn new(dist_dir: impl Into<PathBuf>) -> Self {
        Self {
            dist_dir: dist_dir.into(),
        }
    }

    fn matches(file_name: &str, package: &str, kind: ArtifactKind) -> bool {
        let prefix_plain = format!("{package}-");
        let prefix_norm = format!("{}-", normalized_name(package));
        let prefixed =
            file_name.starts_with(&prefix_plain) || file_name.starts_with(&prefix_norm);
        if !prefixed {
            return false;
        }
        match kind {
            ArtifactKind::Wheel => file_name.ends_with(".whl"),
            ArtifactKind::Sdist => file_name.ends_with(".tar.gz"),
        }
    }
}

impl ArtifactStore for DirArtifactStore {
    fn put(&self, package: &str, kind: ArtifactKind, src: &Path) -> Result<PathBuf> {
        let file_name = src
            .file_name()
            .with_context(|| format!("artifact path has no file name: {}", src.display()))?
            .to_string_lossy()
            .to_string();
        if !Self::matches(&file_name, package, kind) {
            bail!(
                "artifact {} does not look like a {} for package {}",
                file_name,
                kind,
                package
            );
        }

        fs::create_dir_all(&self.dist_dir).with_context(|| {
            format!("failed to create dist dir {}", self.dist_dir.display())
        })?;

        let dest = self.dist_dir.join(&file_name);
        let tmp = self.dist_dir.join(format!(".{file_name}.tmp"));
        fs::copy(src, &tmp)
            .with_context(|| format!("failed to copy {} into store", src.display()))?;
        fs::rename(&tmp, &dest)
            .with_context(|| format!("failed to move artifact into place: {}", dest.display()))?;
        Ok(dest)
    }

    fn get(&self, package: &str, kind: ArtifactKind) -> Result<Option<PathBuf>> {
        if !self.dist_dir.exists() {
            return Ok(None);
        }
        let mut candidates: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.dist_dir)
            .with_context(|| format!("failed to read dist dir {}", self.dist_dir.display()))?
        {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if Self::matches(&name, package, kind) {
                candidates.push(entry.path());
            }
        }
        // Multiple versions can coexist; take the lexically newest.
        candidates.sort();
        Ok(candidates.pop())
    }

    fn index_dir(&self) -> &Path {
        &self.dist_dir
    }
}

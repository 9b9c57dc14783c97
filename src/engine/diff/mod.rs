//! Manifest Diff Engine
//!
//! Computes the bundles that changed between two package versions and
//! drives packaging of the resulting patch artifact.
//!
//! Versions are small increasing integers kept in a plain marker file; the
//! previous version of `N` is always `N - 1`.

pub mod packager;

use crate::engine::manifest::{
    self, read_version_marker, write_version_marker, BundleEntry, ManifestAccessor,
    ManifestError, VersionedManifest,
};
use crate::engine::updater::verify::{ArchiveVerifier, DigestAlgorithm, VerifyError};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use packager::{PackageError, PatchArtifact, PatchPackager};

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Invalid package version: {0}")]
    InvalidVersion(String),

    #[error("Manifest for version {version} not found at {path}")]
    MissingManifest { version: String, path: PathBuf },

    #[error("Bundle hashing failed: {0}")]
    Hash(#[from] VerifyError),

    #[error("Packaging failed: {0}")]
    Package(#[from] PackageError),
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// Why a bundle ended up in a diff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub bundle: String,
    pub file_name: String,
    pub kind: ChangeKind,
}

/// Compare two manifests bundle by bundle.
///
/// A bundle of `current` is reported when `previous` has no bundle of that
/// name, or has one with a different content hash. Bundles that only exist
/// in `previous` are never reported. Without a previous manifest every
/// bundle is reported as added.
pub fn diff_bundles<M>(previous: Option<&M>, current: &M) -> Vec<DiffEntry>
where
    M: ManifestAccessor + ?Sized,
{
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for bundle in current.bundles() {
        let kind = match previous.and_then(|p| p.bundle(&bundle.name)) {
            None => ChangeKind::Added,
            Some(old) if old.content_hash != bundle.content_hash => ChangeKind::Changed,
            Some(_) => continue,
        };

        if seen.insert(bundle.file_name.as_str()) {
            debug!(bundle = %bundle.name, file = %bundle.file_name, ?kind, "bundle differs");
            entries.push(DiffEntry {
                bundle: bundle.name.clone(),
                file_name: bundle.file_name.clone(),
                kind,
            });
        }
    }

    entries
}

/// File names of the bundles in `current` that are new or changed,
/// in manifest order.
pub fn diff<M>(previous: Option<&M>, current: &M) -> Vec<String>
where
    M: ManifestAccessor + ?Sized,
{
    diff_bundles(previous, current)
        .into_iter()
        .map(|entry| entry.file_name)
        .collect()
}

/// Parse an integer package version.
pub fn parse_version(version: &str) -> Result<u64> {
    version
        .trim()
        .parse::<u64>()
        .map_err(|_| DiffError::InvalidVersion(version.to_string()))
}

/// Previous version under the arithmetic scheme, `None` for the first version.
pub fn previous_version(current: &str) -> Result<Option<String>> {
    let current = parse_version(current)?;
    Ok(current
        .checked_sub(1)
        .filter(|prev| *prev > 0)
        .map(|prev| prev.to_string()))
}

/// Filesystem layout of build outputs and patch artifacts
#[derive(Debug, Clone)]
pub struct BuildLayout {
    output_root: PathBuf,
    diff_root: PathBuf,
    package: String,
}

impl BuildLayout {
    pub fn new(output_root: PathBuf, diff_root: PathBuf, package: impl Into<String>) -> Self {
        Self {
            output_root,
            diff_root,
            package: package.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    /// `<output_root>/<package>`
    pub fn package_dir(&self) -> PathBuf {
        self.output_root.join(&self.package)
    }

    /// Directory holding the bundles and manifest of one build
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.package_dir().join(version)
    }

    pub fn manifest_path(&self, version: &str) -> PathBuf {
        self.version_dir(version)
            .join(manifest::manifest_file_name(&self.package, version))
    }

    pub fn marker_path(&self, version: &str) -> PathBuf {
        self.version_dir(version)
            .join(manifest::version_marker_file_name(&self.package))
    }

    /// Output directory of the patch artifact for a version
    pub fn artifact_dir(&self, version: &str) -> PathBuf {
        self.diff_root.join(version)
    }

    /// Temporary directory used to assemble the archive contents
    pub fn staging_dir(&self, version: &str) -> PathBuf {
        self.diff_root.join(format!(".staging-{}", version))
    }

    pub fn archive_path(&self, version: &str) -> PathBuf {
        self.artifact_dir(version)
            .join(format!("{}_{}.zip", self.package, version))
    }

    /// Load the manifest of a build, `None` when it was never produced.
    pub fn load_manifest(&self, version: &str) -> Result<Option<VersionedManifest>> {
        let path = self.manifest_path(version);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(VersionedManifest::load(&path)?))
    }
}

/// Bump the integer version kept in a marker file and return the new value.
///
/// A missing marker counts as version 0, so the first build is version 1.
pub fn next_build_version(marker_path: &Path) -> Result<String> {
    let current = match read_version_marker(marker_path)? {
        Some(v) => parse_version(&v)?,
        None => 0,
    };
    let next = (current + 1).to_string();
    write_version_marker(marker_path, &next)?;
    Ok(next)
}

/// Record a directory of built bundles as a new versioned snapshot.
///
/// Every file below `bundles_dir` becomes a bundle named by its relative
/// path and hashed with SHA-256. Files are copied into the version
/// directory next to the binary manifest and the version marker.
pub fn snapshot_bundles(
    layout: &BuildLayout,
    bundles_dir: &Path,
    version: &str,
) -> Result<VersionedManifest> {
    let version_dir = layout.version_dir(version);
    fs::create_dir_all(&version_dir)?;

    let mut files = Vec::new();
    collect_files(bundles_dir, bundles_dir, &mut files)?;
    files.sort();

    let mut bundles = Vec::with_capacity(files.len());
    for relative in files {
        let source = bundles_dir.join(&relative);
        let dest = version_dir.join(&relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&source, &dest)?;

        let content_hash = ArchiveVerifier::digest_file(&dest, DigestAlgorithm::Sha256)?;
        let size = fs::metadata(&dest)?.len();
        bundles.push(BundleEntry::new(relative.clone(), content_hash, relative, size));
    }

    let manifest = VersionedManifest::new(layout.package(), version, bundles)?;
    manifest::write_manifest(&layout.manifest_path(version), &manifest)?;
    write_version_marker(&layout.marker_path(version), version)?;

    info!(
        version,
        bundles = manifest.len(),
        bytes = manifest.total_size(),
        "snapshot recorded"
    );
    Ok(manifest)
}

/// Diff a build against its predecessor and package the patch artifact.
///
/// A missing or unreadable previous manifest falls back to packaging every
/// bundle of the current build.
pub fn build_patch(layout: &BuildLayout, version: &str) -> Result<PatchArtifact> {
    let current = layout
        .load_manifest(version)?
        .ok_or_else(|| DiffError::MissingManifest {
            version: version.to_string(),
            path: layout.manifest_path(version),
        })?;

    let previous = match previous_version(version)? {
        Some(prev) => match layout.load_manifest(&prev) {
            Ok(Some(manifest)) => {
                info!(previous = %prev, "diffing against previous version");
                Some(manifest)
            }
            Ok(None) => {
                warn!(previous = %prev, "previous manifest not found, packaging all bundles");
                None
            }
            Err(e) => {
                warn!(previous = %prev, error = %e, "previous manifest unreadable, packaging all bundles");
                None
            }
        },
        None => {
            warn!(version, "no previous version, packaging all bundles");
            None
        }
    };

    let files = diff(previous.as_ref(), &current);
    info!(version, changed = files.len(), "diff computed");

    let packager = PatchPackager::new(layout.clone());
    Ok(packager.package(&current, &files)?)
}

/// Relative paths (with `/` separators) of all files below `dir`
pub(crate) fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(version: &str, entries: &[(&str, &str)]) -> VersionedManifest {
        let bundles = entries
            .iter()
            .map(|(name, hash)| BundleEntry::new(*name, *hash, format!("{}.bundle", name), 1))
            .collect();
        VersionedManifest::new("DefaultPackage", version, bundles).unwrap()
    }

    #[test]
    fn test_identical_manifests_have_empty_diff() {
        let a = manifest("1", &[("ui", "h1"), ("audio", "h2")]);
        let b = manifest("2", &[("audio", "h2"), ("ui", "h1")]);
        assert!(diff(Some(&a), &b).is_empty());
    }

    #[test]
    fn test_added_bundle_reported_once() {
        let a = manifest("1", &[("ui", "h1")]);
        let b = manifest("2", &[("ui", "h1"), ("maps", "h9")]);
        assert_eq!(diff(Some(&a), &b), vec!["maps.bundle"]);
    }

    #[test]
    fn test_changed_hash_reported_once() {
        let a = manifest("1", &[("ui", "h1"), ("audio", "h2")]);
        let b = manifest("2", &[("ui", "h1"), ("audio", "h3")]);

        let entries = diff_bundles(Some(&a), &b);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].file_name, "audio.bundle");
        assert_eq!(entries[0].kind, ChangeKind::Changed);
    }

    #[test]
    fn test_removed_bundles_not_reported() {
        let a = manifest("1", &[("ui", "h1"), ("legacy", "h0")]);
        let b = manifest("2", &[("ui", "h1")]);
        assert!(diff(Some(&a), &b).is_empty());
    }

    #[test]
    fn test_absent_previous_reports_everything_in_order() {
        let b = manifest("1", &[("ui", "h1"), ("audio", "h2"), ("maps", "h3")]);
        assert_eq!(
            diff(None, &b),
            vec!["ui.bundle", "audio.bundle", "maps.bundle"]
        );
    }

    #[test]
    fn test_previous_version() {
        assert_eq!(previous_version("5").unwrap(), Some("4".to_string()));
        assert_eq!(previous_version("1").unwrap(), None);
        assert!(matches!(previous_version("1.0.1"), Err(DiffError::InvalidVersion(_))));
    }

    #[test]
    fn test_next_build_version() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("version.txt");

        assert_eq!(next_build_version(&marker).unwrap(), "1");
        assert_eq!(next_build_version(&marker).unwrap(), "2");
        assert_eq!(read_version_marker(&marker).unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_snapshot_hashes_and_copies() {
        let dir = tempdir().unwrap();
        let bundles = dir.path().join("bundles");
        fs::create_dir_all(bundles.join("maps")).unwrap();
        fs::write(bundles.join("ui.bundle"), b"ui v1").unwrap();
        fs::write(bundles.join("maps/forest.bundle"), b"forest").unwrap();

        let layout = BuildLayout::new(dir.path().join("out"), dir.path().join("diff"), "DefaultPackage");
        let manifest = snapshot_bundles(&layout, &bundles, "1").unwrap();

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.bundles()[0].name, "maps/forest.bundle");
        assert!(layout.version_dir("1").join("maps/forest.bundle").exists());
        assert!(layout.manifest_path("1").exists());
        assert_eq!(
            read_version_marker(&layout.marker_path("1")).unwrap(),
            Some("1".to_string())
        );

        let reloaded = layout.load_manifest("1").unwrap().unwrap();
        assert_eq!(reloaded, manifest);
    }
}

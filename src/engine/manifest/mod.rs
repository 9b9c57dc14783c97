//! Versioned Bundle Manifests
//!
//! A manifest lists every content bundle of one package version together
//! with the hash of its content. Manifests are produced by the build
//! pipeline, compared by the diff engine and reloaded by the runtime
//! content index.
//!
//! Components:
//! - `codec` - Binary `.bytes` encoding
//! - `marker` - Plain-text version marker files

pub mod codec;
pub mod marker;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

pub use codec::{decode_manifest, encode_manifest, read_manifest, write_manifest};
pub use marker::{read_version_marker, write_version_marker};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a manifest file (bad magic)")]
    BadMagic,

    #[error("Manifest format version {0} not supported")]
    UnsupportedFormat(u16),

    #[error("Manifest truncated at byte {0}")]
    Truncated(usize),

    #[error("Invalid UTF-8 in manifest field: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Duplicate bundle name in manifest: {0}")]
    DuplicateBundle(String),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// One named, content-addressed unit of payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// Unique bundle name within a manifest
    pub name: String,
    /// Hash of the bundle content as published by the build pipeline
    pub content_hash: String,
    /// File name relative to the version directory
    pub file_name: String,
    /// Size in bytes
    pub size: u64,
}

impl BundleEntry {
    pub fn new(
        name: impl Into<String>,
        content_hash: impl Into<String>,
        file_name: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            name: name.into(),
            content_hash: content_hash.into(),
            file_name: file_name.into(),
            size,
        }
    }
}

/// Read-only view over a versioned bundle listing.
///
/// The binary layout behind a manifest is opaque to callers; everything
/// the diff engine and the content index need goes through this trait.
pub trait ManifestAccessor {
    /// Package this manifest belongs to
    fn package(&self) -> &str;

    /// Version identifier of the snapshot
    fn version(&self) -> &str;

    /// Resolve a bundle by its unique name
    fn bundle(&self, name: &str) -> Option<&BundleEntry>;

    /// All bundles, in stable build order
    fn bundles(&self) -> &[BundleEntry];
}

/// An immutable manifest snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedManifest {
    package: String,
    version: String,
    bundles: Vec<BundleEntry>,
    by_name: HashMap<String, usize>,
}

impl VersionedManifest {
    /// Build a manifest, rejecting duplicate bundle names.
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        bundles: Vec<BundleEntry>,
    ) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(bundles.len());
        for (idx, bundle) in bundles.iter().enumerate() {
            if by_name.insert(bundle.name.clone(), idx).is_some() {
                return Err(ManifestError::DuplicateBundle(bundle.name.clone()));
            }
        }

        Ok(Self {
            package: package.into(),
            version: version.into(),
            bundles,
            by_name,
        })
    }

    /// Load a manifest from a `.bytes` file.
    pub fn load(path: &Path) -> Result<Self> {
        read_manifest(path)
    }

    /// Total payload size of all bundles
    pub fn total_size(&self) -> u64 {
        self.bundles.iter().map(|b| b.size).sum()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

impl ManifestAccessor for VersionedManifest {
    fn package(&self) -> &str {
        &self.package
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn bundle(&self, name: &str) -> Option<&BundleEntry> {
        self.by_name.get(name).map(|&idx| &self.bundles[idx])
    }

    fn bundles(&self) -> &[BundleEntry] {
        &self.bundles
    }
}

/// File name of the binary manifest for a package version
pub fn manifest_file_name(package: &str, version: &str) -> String {
    format!("{}_{}.bytes", package, version)
}

/// File name of the version marker shipped with a patch artifact
pub fn version_marker_file_name(package: &str) -> String {
    format!("{}.version", package)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_lookup() {
        let manifest = VersionedManifest::new(
            "DefaultPackage",
            "3",
            vec![
                BundleEntry::new("ui", "aaa", "ui_aaa.bundle", 10),
                BundleEntry::new("audio", "bbb", "audio_bbb.bundle", 20),
            ],
        )
        .unwrap();

        assert_eq!(manifest.version(), "3");
        assert_eq!(manifest.bundle("audio").unwrap().file_name, "audio_bbb.bundle");
        assert!(manifest.bundle("missing").is_none());
        assert_eq!(manifest.total_size(), 30);
        assert_eq!(manifest.bundles()[0].name, "ui");
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = VersionedManifest::new(
            "DefaultPackage",
            "1",
            vec![
                BundleEntry::new("ui", "aaa", "ui_a.bundle", 1),
                BundleEntry::new("ui", "bbb", "ui_b.bundle", 1),
            ],
        );
        assert!(matches!(result, Err(ManifestError::DuplicateBundle(name)) if name == "ui"));
    }

    #[test]
    fn test_file_names() {
        assert_eq!(manifest_file_name("DefaultPackage", "4"), "DefaultPackage_4.bytes");
        assert_eq!(version_marker_file_name("DefaultPackage"), "DefaultPackage.version");
    }
}

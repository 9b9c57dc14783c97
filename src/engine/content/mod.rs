//! Content index
//!
//! Resolves named assets to files through the manifest of the current local
//! version. The index is re-pointed at the sandbox after an update and its
//! manifest reloaded; lookups fall back to the builtin root when a bundle is
//! listed but not present in the sandbox.

pub mod loader;

use crate::engine::manifest::{manifest_file_name, ManifestAccessor, ManifestError, VersionedManifest};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use loader::{ModuleLoader, ModuleReport};

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("No manifest for version {version} under {searched:?}")]
    ManifestNotFound { version: String, searched: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct ContentIndex {
    package: String,
    root: Option<PathBuf>,
    builtin_root: PathBuf,
    manifest: Option<VersionedManifest>,
}

impl ContentIndex {
    pub fn new(package: impl Into<String>, builtin_root: PathBuf) -> Self {
        Self {
            package: package.into(),
            root: None,
            builtin_root,
            manifest: None,
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Point the index at a new content root. The current manifest is
    /// dropped until the next [`install`](Self::install).
    pub fn point_at(&mut self, root: PathBuf) {
        self.root = Some(root);
        self.manifest = None;
    }

    pub fn manifest(&self) -> Option<&VersionedManifest> {
        self.manifest.as_ref()
    }

    pub fn install(&mut self, manifest: VersionedManifest) {
        self.manifest = Some(manifest);
    }

    /// Candidate manifest locations for `version`, sandbox first
    pub fn manifest_candidates(&self, version: &str) -> Vec<PathBuf> {
        let file = manifest_file_name(&self.package, version);
        let mut candidates = Vec::new();
        if let Some(root) = &self.root {
            candidates.push(root.join(&file));
            candidates.push(root.join(&self.package).join(&file));
        }
        candidates.push(self.builtin_root.join(&file));
        candidates.push(self.builtin_root.join(&self.package).join(&file));
        candidates
    }

    /// Load the manifest for `version` from the first existing candidate.
    /// Blocking; run off the scheduler.
    pub fn load_manifest(candidates: &[PathBuf], version: &str) -> Result<VersionedManifest, ContentError> {
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Ok(VersionedManifest::load(path)?),
            None => Err(ContentError::ManifestNotFound {
                version: version.to_string(),
                searched: candidates.to_vec(),
            }),
        }
    }

    /// File backing asset `id`, matched by bundle name or file name
    pub fn resolve(&self, id: &str) -> Option<PathBuf> {
        let manifest = self.manifest.as_ref()?;
        let entry = manifest.bundle(id).or_else(|| {
            manifest.bundles().iter().find(|b| {
                b.file_name == id || Path::new(&b.file_name).file_name().is_some_and(|n| n == id)
            })
        })?;

        self.root
            .iter()
            .map(|root| root.join(&entry.file_name))
            .chain(std::iter::once(self.builtin_root.join(&entry.file_name)))
            .find(|p| p.is_file())
    }

    /// Bytes of asset `id`, `None` when the index cannot resolve it
    pub fn read(&self, id: &str) -> Result<Option<(Vec<u8>, PathBuf)>, ContentError> {
        match self.resolve(id) {
            Some(path) => Ok(Some((fs::read(&path)?, path))),
            None => Ok(None),
        }
    }
}

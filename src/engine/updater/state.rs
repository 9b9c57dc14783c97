//! Local Update State
//!
//! What the device knows about its own content: the applied version, where
//! the sandbox lives, the archive currently in flight and the modules
//! loaded during this session. Only the version is persisted, and it only
//! changes through [`LocalUpdateState::commit_version`].

use super::layout::SandboxLayout;
use crate::engine::manifest::{read_version_marker, write_version_marker};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Version written on first run
pub const BOOTSTRAP_VERSION: &str = "1";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access version marker: {0}")]
    Io(#[from] io::Error),

    #[error("Local version is not an integer: {0:?}")]
    InvalidVersion(String),
}

/// Retrieval outcome of one named module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleSlot {
    Loaded { bytes: Vec<u8>, source: PathBuf },
    Missing,
}

impl ModuleSlot {
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Loaded { bytes, .. } => Some(bytes),
            Self::Missing => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalUpdateState {
    version: String,
    marker_path: PathBuf,
    sandbox_dir: PathBuf,
    pending_archive: Option<PathBuf>,
    modules: BTreeMap<String, ModuleSlot>,
}

impl LocalUpdateState {
    /// Load the persisted version, writing the bootstrap version when the
    /// marker is absent.
    pub fn load(layout: &SandboxLayout) -> Result<Self, StateError> {
        let marker_path = layout.version_marker_path();
        let version = match read_version_marker(&marker_path)? {
            Some(version) => version,
            None => {
                write_version_marker(&marker_path, BOOTSTRAP_VERSION)?;
                info!(version = BOOTSTRAP_VERSION, "bootstrapped local version");
                BOOTSTRAP_VERSION.to_string()
            }
        };

        Ok(Self {
            version,
            marker_path,
            sandbox_dir: layout.sandbox_dir(),
            pending_archive: None,
            modules: BTreeMap::new(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn version_number(&self) -> Result<u64, StateError> {
        self.version
            .parse()
            .map_err(|_| StateError::InvalidVersion(self.version.clone()))
    }

    pub fn sandbox_dir(&self) -> &Path {
        &self.sandbox_dir
    }

    /// Persist a new version atomically, then adopt it in memory.
    pub fn commit_version(&mut self, version: &str) -> Result<(), StateError> {
        write_version_marker(&self.marker_path, version)?;
        info!(from = %self.version, to = version, "local version committed");
        self.version = version.to_string();
        Ok(())
    }

    pub fn pending_archive(&self) -> Option<&Path> {
        self.pending_archive.as_deref()
    }

    pub fn set_pending_archive(&mut self, path: PathBuf) {
        self.pending_archive = Some(path);
    }

    pub fn take_pending_archive(&mut self) -> Option<PathBuf> {
        self.pending_archive.take()
    }

    pub fn record_module(&mut self, id: impl Into<String>, slot: ModuleSlot) {
        self.modules.insert(id.into(), slot);
    }

    pub fn modules(&self) -> &BTreeMap<String, ModuleSlot> {
        &self.modules
    }

    pub fn module(&self, id: &str) -> Option<&ModuleSlot> {
        self.modules.get(id)
    }

    pub fn missing_modules(&self) -> Vec<&str> {
        self.modules
            .iter()
            .filter(|(_, slot)| matches!(slot, ModuleSlot::Missing))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn clear_modules(&mut self) {
        self.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn layout(dir: &Path) -> SandboxLayout {
        SandboxLayout::with_base_dir(dir.to_path_buf(), dir.join("builtin"))
    }

    #[test]
    fn test_bootstrap_writes_marker() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());

        let state = LocalUpdateState::load(&layout).unwrap();
        assert_eq!(state.version(), "1");
        assert_eq!(fs::read_to_string(layout.version_marker_path()).unwrap(), "1");
    }

    #[test]
    fn test_commit_persists() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        fs::write(layout.version_marker_path(), "3").unwrap();

        let mut state = LocalUpdateState::load(&layout).unwrap();
        assert_eq!(state.version_number().unwrap(), 3);

        state.commit_version("5").unwrap();
        let reloaded = LocalUpdateState::load(&layout).unwrap();
        assert_eq!(reloaded.version(), "5");
    }

    #[test]
    fn test_invalid_version() {
        let dir = tempdir().unwrap();
        let layout = layout(dir.path());
        fs::write(layout.version_marker_path(), "1.2.3").unwrap();

        let state = LocalUpdateState::load(&layout).unwrap();
        assert!(matches!(state.version_number(), Err(StateError::InvalidVersion(_))));
    }

    #[test]
    fn test_module_registry() {
        let dir = tempdir().unwrap();
        let mut state = LocalUpdateState::load(&layout(dir.path())).unwrap();

        state.record_module(
            "HotUpdate.dll",
            ModuleSlot::Loaded {
                bytes: vec![1, 2, 3],
                source: dir.path().join("HotUpdate.dll"),
            },
        );
        state.record_module("Extra.dll", ModuleSlot::Missing);

        assert_eq!(state.module("HotUpdate.dll").unwrap().bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(state.missing_modules(), vec!["Extra.dll"]);
    }
}

//! Runtime Layout
//!
//! Owns the on-device directory layout used by the updater:
//!
//! ```text
//! <base>/
//! ├── sandbox/          # extracted patch content (authoritative local root)
//! ├── downloads/        # archives in flight, removed after extraction
//! ├── resversion.txt    # locally applied content version
//! └── device_id         # generated once, reused on every info request
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Could not determine a data directory for this platform")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct SandboxLayout {
    base_dir: PathBuf,
    builtin_root: PathBuf,
}

impl SandboxLayout {
    /// Layout under the platform data directory
    ///
    /// Linux: ~/.local/share/hotpatch/
    /// Windows: %APPDATA%\hotpatch\
    /// macOS: ~/Library/Application Support/hotpatch/
    pub fn new(builtin_root: PathBuf) -> Result<Self, LayoutError> {
        let base_dir = dirs::data_dir().ok_or(LayoutError::NoDataDir)?.join("hotpatch");
        Ok(Self::with_base_dir(base_dir, builtin_root))
    }

    /// Create with custom base directory (for testing)
    pub fn with_base_dir(base_dir: PathBuf, builtin_root: PathBuf) -> Self {
        Self {
            base_dir,
            builtin_root,
        }
    }

    pub fn init(&self) -> Result<(), LayoutError> {
        fs::create_dir_all(self.sandbox_dir())?;
        fs::create_dir_all(self.downloads_dir())?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Engine-bundled read-only content shipped with the install
    pub fn builtin_root(&self) -> &Path {
        &self.builtin_root
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.base_dir.join("sandbox")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    /// Download target for an archive named by the server
    pub fn download_path(&self, file: &str) -> PathBuf {
        let name = Path::new(file)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "patch.zip".into());
        self.downloads_dir().join(name)
    }

    pub fn version_marker_path(&self) -> PathBuf {
        self.base_dir.join("resversion.txt")
    }

    pub fn device_id_path(&self) -> PathBuf {
        self.base_dir.join("device_id")
    }

    /// Previously generated device identifier, if any
    pub fn stored_device_id(&self) -> Result<Option<String>, LayoutError> {
        match fs::read_to_string(self.device_id_path()) {
            Ok(existing) if !existing.trim().is_empty() => Ok(Some(existing.trim().to_string())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stable device identifier, generated on first use
    pub fn device_id(&self) -> Result<String, LayoutError> {
        if let Some(existing) = self.stored_device_id()? {
            return Ok(existing);
        }

        let id = uuid::Uuid::new_v4().to_string();
        fs::create_dir_all(&self.base_dir)?;
        fs::write(self.device_id_path(), &id)?;
        info!(device_id = %id, "generated device id");
        Ok(id)
    }
}

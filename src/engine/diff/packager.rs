//! Patch Packager
//!
//! Writes the patch artifact for one version:
//!
//! ```text
//! <diff_root>/<version>/
//! ├── <package>.version          # literal version string
//! ├── <package>_<version>.bytes  # binary manifest copy
//! └── <package>_<version>.zip    # only when the diff is non-empty
//! ```

use super::{collect_files, BuildLayout};
use crate::engine::manifest::{self, ManifestAccessor, ManifestError, VersionedManifest};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Bundle file missing from build output: {0}")]
    MissingBundle(PathBuf),
}

/// Result of packaging one version
#[derive(Debug, Clone)]
pub struct PatchArtifact {
    pub version: String,
    pub dir: PathBuf,
    pub marker_path: PathBuf,
    pub manifest_path: PathBuf,
    /// Present iff `files` is non-empty
    pub archive_path: Option<PathBuf>,
    pub files: Vec<String>,
}

/// Builds patch artifacts from a build layout
pub struct PatchPackager {
    layout: BuildLayout,
}

impl PatchPackager {
    pub fn new(layout: BuildLayout) -> Self {
        Self { layout }
    }

    /// Package `current` together with the archive of `files`.
    ///
    /// The marker and manifest are always written. Any stale archive or
    /// staging directory of the same version is removed first, and the
    /// staging directory never outlives this call.
    pub fn package(
        &self,
        current: &VersionedManifest,
        files: &[String],
    ) -> Result<PatchArtifact, PackageError> {
        let version = current.version();
        let dir = self.layout.artifact_dir(version);
        fs::create_dir_all(&dir)?;

        let marker_path = dir.join(manifest::version_marker_file_name(self.layout.package()));
        manifest::write_version_marker(&marker_path, version)?;

        let manifest_path = dir.join(manifest::manifest_file_name(self.layout.package(), version));
        manifest::write_manifest(&manifest_path, current)?;

        let archive_path = self.layout.archive_path(version);
        if archive_path.exists() {
            fs::remove_file(&archive_path)?;
        }

        if files.is_empty() {
            info!(version, "no changed bundles, skipping archive");
            return Ok(PatchArtifact {
                version: version.to_string(),
                dir,
                marker_path,
                manifest_path,
                archive_path: None,
                files: Vec::new(),
            });
        }

        let staging = StagingDir::create(self.layout.staging_dir(version))?;
        let source_dir = self.layout.version_dir(version);
        for file in files {
            let source = source_dir.join(file);
            if !source.is_file() {
                return Err(PackageError::MissingBundle(source));
            }
            let dest = staging.path().join(file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &dest)?;
            debug!(file = %file, "staged bundle");
        }

        let temp_archive = archive_path.with_extension("zip.tmp");
        if let Err(e) = zip_directory(staging.path(), &temp_archive) {
            let _ = fs::remove_file(&temp_archive);
            return Err(e);
        }
        fs::rename(&temp_archive, &archive_path)?;

        info!(
            version,
            files = files.len(),
            archive = %archive_path.display(),
            "patch archive written"
        );

        Ok(PatchArtifact {
            version: version.to_string(),
            dir,
            marker_path,
            manifest_path,
            archive_path: Some(archive_path),
            files: files.to_vec(),
        })
    }
}

/// Compress every file below `source` into a zip at `dest`.
///
/// Entries are written in sorted order with a fixed timestamp so the same
/// input produces the same archive.
fn zip_directory(source: &Path, dest: &Path) -> Result<(), PackageError> {
    let mut files = Vec::new();
    collect_files(source, source, &mut files)?;
    files.sort();

    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut writer = ZipWriter::new(File::create(dest)?);
    for name in &files {
        writer.start_file(name.as_str(), options)?;
        let mut input = File::open(source.join(name))?;
        io::copy(&mut input, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

/// Staging directory removed on drop, whatever the packaging outcome.
struct StagingDir {
    path: PathBuf,
}

impl StagingDir {
    fn create(path: PathBuf) -> io::Result<Self> {
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove staging directory");
        }
    }
}

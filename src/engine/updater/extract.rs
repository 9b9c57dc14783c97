//! Patch extraction
//!
//! Unpacks a verified archive into the content sandbox. Files at colliding
//! relative paths are overwritten. Entries that would land outside the
//! sandbox are rejected before anything is written for them.

use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Archive entry escapes the sandbox: {0}")]
    UnsafePath(String),

    #[error("Extraction worker stopped without reporting")]
    WorkerLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub bytes: u64,
}

/// Extract `archive` into `dest`, creating `dest` if needed.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<ExtractReport, ExtractError> {
    let format = ArchiveFormat::detect(archive)
        .ok_or_else(|| ExtractError::UnsupportedFormat(archive.to_path_buf()))?;
    fs::create_dir_all(dest)?;

    let report = match format {
        ArchiveFormat::Zip => extract_zip(archive, dest)?,
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest)?,
    };

    info!(
        archive = %archive.display(),
        files = report.files,
        bytes = report.bytes,
        "archive extracted"
    );
    Ok(report)
}

fn extract_zip(archive: &Path, dest: &Path) -> Result<ExtractReport, ExtractError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    let mut report = ExtractReport::default();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| ExtractError::UnsafePath(entry.name().to_string()))?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut output = File::create(&target)?;
        report.bytes += io::copy(&mut entry, &mut output)?;
        report.files += 1;
        debug!(file = %target.display(), "extracted");
    }

    Ok(report)
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<ExtractReport, ExtractError> {
    let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    let mut report = ExtractReport::default();

    for entry in tar.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        if !is_enclosed(&relative) {
            return Err(ExtractError::UnsafePath(relative.display().to_string()));
        }
        let target = dest.join(&relative);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !kind.is_file() {
            debug!(entry = %relative.display(), "skipping non-regular entry");
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.exists() {
            fs::remove_file(&target)?;
        }
        report.bytes += entry.size();
        entry.unpack(&target)?;
        report.files += 1;
        debug!(file = %target.display(), "extracted");
    }

    Ok(report)
}

fn is_enclosed(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

type Slot = Arc<OnceLock<Result<ExtractReport, ExtractError>>>;

/// Background extraction worker.
///
/// The worker owns the single write to `slot`; the coordinator only reads
/// it. Dropping the job does not stop the worker, its result is simply
/// never looked at.
pub struct ExtractJob {
    slot: Slot,
    handle: Option<JoinHandle<()>>,
}

impl ExtractJob {
    pub fn spawn(archive: PathBuf, dest: PathBuf) -> io::Result<Self> {
        let slot: Slot = Arc::new(OnceLock::new());
        let writer = Arc::clone(&slot);
        let handle = thread::Builder::new()
            .name("hotpatch-extract".to_string())
            .spawn(move || {
                let _ = writer.set(extract_archive(&archive, &dest));
            })?;
        Ok(Self {
            slot,
            handle: Some(handle),
        })
    }

    /// Worker finished, successfully or not
    fn is_finished(&self) -> bool {
        self.slot.get().is_some() || self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Take the result once the worker has finished. Returns `None` while
    /// it is still running.
    pub fn try_take(&mut self) -> Option<Result<ExtractReport, ExtractError>> {
        if !self.is_finished() {
            return None;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        match Arc::get_mut(&mut self.slot).and_then(OnceLock::take) {
            Some(result) => Some(result),
            None => Some(Err(ExtractError::WorkerLost)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(ArchiveFormat::detect(Path::new("a/P_5.zip")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(Path::new("P_5.TAR.GZ")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("P_5.tgz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("P_5.rar")), None);
    }

    #[test]
    fn test_zip_overwrites_existing() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("patch.zip");
        let sandbox = dir.path().join("sandbox");
        fs::create_dir_all(sandbox.join("maps")).unwrap();
        fs::write(sandbox.join("maps/forest.bundle"), b"old").unwrap();
        fs::write(sandbox.join("keep.bundle"), b"untouched").unwrap();

        write_zip(&archive, &[("maps/forest.bundle", b"new"), ("ui.bundle", b"ui")]);

        let report = extract_archive(&archive, &sandbox).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(fs::read(sandbox.join("maps/forest.bundle")).unwrap(), b"new");
        assert_eq!(fs::read(sandbox.join("ui.bundle")).unwrap(), b"ui");
        assert_eq!(fs::read(sandbox.join("keep.bundle")).unwrap(), b"untouched");
    }

    #[test]
    fn test_zip_rejects_escaping_entry() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../outside.bundle", b"x")]);

        let result = extract_archive(&archive, &dir.path().join("sandbox"));
        assert!(matches!(result, Err(ExtractError::UnsafePath(_))));
        assert!(!dir.path().join("outside.bundle").exists());
    }

    #[test]
    fn test_tar_gz_extraction() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("patch.tar.gz");
        {
            let encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"dll bytes";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "Resources/HotUpdate.dll", &data[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let sandbox = dir.path().join("sandbox");
        let report = extract_archive(&archive, &sandbox).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(fs::read(sandbox.join("Resources/HotUpdate.dll")).unwrap(), b"dll bytes");
    }

    #[test]
    fn test_job_reports_once() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("patch.zip");
        write_zip(&archive, &[("a.bundle", b"a")]);

        let mut job = ExtractJob::spawn(archive, dir.path().join("sandbox")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let result = loop {
            if let Some(result) = job.try_take() {
                break result;
            }
            assert!(Instant::now() < deadline, "extract worker timed out");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(result.unwrap().files, 1);
    }
}

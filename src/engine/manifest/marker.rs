//! Plain-text version markers.
//!
//! A marker file holds nothing but the literal version string. The build
//! side uses one to track the current package version, the runtime uses one
//! to remember the locally applied content version.

use std::fs;
use std::io;
use std::path::Path;

/// Read a version marker. Returns `None` when the file does not exist or is blank.
pub fn read_version_marker(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let version = content.trim();
            if version.is_empty() {
                Ok(None)
            } else {
                Ok(Some(version.to_string()))
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a version marker atomically (temp file, then rename).
pub fn write_version_marker(path: &Path, version: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = Path::new(&temp_name);

    fs::write(temp_path, version)?;
    fs::rename(temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_marker() {
        let dir = tempdir().unwrap();
        assert_eq!(read_version_marker(&dir.path().join("version.txt")).unwrap(), None);
    }

    #[test]
    fn test_marker_roundtrip_trims() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("version.txt");

        write_version_marker(&path, "12").unwrap();
        assert_eq!(read_version_marker(&path).unwrap(), Some("12".to_string()));

        fs::write(&path, "13\n").unwrap();
        assert_eq!(read_version_marker(&path).unwrap(), Some("13".to_string()));
    }
}

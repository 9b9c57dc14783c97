//! Binary manifest encoding.
//!
//! Layout (little endian):
//! magic `HPMF`, format `u16`, package, version, bundle count `u32`,
//! then per bundle: name, content hash, file name, size `u64`.
//! Strings are a `u32` byte length followed by UTF-8.

use super::{BundleEntry, ManifestAccessor, ManifestError, Result, VersionedManifest};
use std::fs;
use std::path::Path;

const MAGIC: &[u8; 4] = b"HPMF";
const FORMAT_VERSION: u16 = 1;

/// Serialize a manifest into its binary representation.
pub fn encode_manifest(manifest: &VersionedManifest) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64 + manifest.len() * 96);

    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    put_str(&mut bytes, manifest.package());
    put_str(&mut bytes, manifest.version());

    bytes.extend_from_slice(&(manifest.len() as u32).to_le_bytes());
    for bundle in manifest.bundles() {
        put_str(&mut bytes, &bundle.name);
        put_str(&mut bytes, &bundle.content_hash);
        put_str(&mut bytes, &bundle.file_name);
        bytes.extend_from_slice(&bundle.size.to_le_bytes());
    }

    bytes
}

/// Parse a manifest from its binary representation.
pub fn decode_manifest(bytes: &[u8]) -> Result<VersionedManifest> {
    let mut reader = Reader { buf: bytes, pos: 0 };

    if reader.take(4)? != MAGIC {
        return Err(ManifestError::BadMagic);
    }
    let format = u16::from_le_bytes(reader.array::<2>()?);
    if format != FORMAT_VERSION {
        return Err(ManifestError::UnsupportedFormat(format));
    }

    let package = reader.string()?;
    let version = reader.string()?;
    let count = u32::from_le_bytes(reader.array::<4>()?) as usize;

    // Cap the pre-allocation so a corrupt count cannot exhaust memory
    let mut bundles = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let name = reader.string()?;
        let content_hash = reader.string()?;
        let file_name = reader.string()?;
        let size = u64::from_le_bytes(reader.array::<8>()?);
        bundles.push(BundleEntry {
            name,
            content_hash,
            file_name,
            size,
        });
    }

    VersionedManifest::new(package, version, bundles)
}

/// Read and decode a manifest file.
pub fn read_manifest(path: &Path) -> Result<VersionedManifest> {
    let bytes = fs::read(path)?;
    decode_manifest(&bytes)
}

/// Encode and write a manifest file atomically.
pub fn write_manifest(path: &Path, manifest: &VersionedManifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("bytes.tmp");
    fs::write(&temp_path, encode_manifest(manifest))?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

fn put_str(bytes: &mut Vec<u8>, value: &str) {
    bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
    bytes.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(ManifestError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        let len = u32::from_le_bytes(self.array::<4>()?) as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> VersionedManifest {
        VersionedManifest::new(
            "DefaultPackage",
            "7",
            vec![
                BundleEntry::new("ui", "9f86d081", "ui_9f86d081.bundle", 1024),
                BundleEntry::new("maps/forest", "60303ae2", "maps/forest.bundle", 99),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_file_roundtrip_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("DefaultPackage_7.bytes");

        write_manifest(&path, &sample()).unwrap();
        let loaded = read_manifest(&path).unwrap();

        assert_eq!(loaded, sample());
        assert_eq!(loaded.bundles()[1].file_name, "maps/forest.bundle");
        assert!(!dir.path().join("DefaultPackage_7.bytes.tmp").exists());
    }

    #[test]
    fn test_bad_magic() {
        let result = decode_manifest(b"NOPE\x01\x00");
        assert!(matches!(result, Err(ManifestError::BadMagic)));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode_manifest(&sample());
        let result = decode_manifest(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(ManifestError::Truncated(_))));
    }

    #[test]
    fn test_unsupported_format() {
        let mut bytes = encode_manifest(&sample());
        bytes[4] = 9;
        let result = decode_manifest(&bytes);
        assert!(matches!(result, Err(ManifestError::UnsupportedFormat(9))));
    }
}

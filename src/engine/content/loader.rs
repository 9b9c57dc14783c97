//! Module loading with filesystem fallbacks.
//!
//! Each identifier is tried against the content index first, then against
//! a fixed list of directories, then by a recursive name search under the
//! sandbox. A miss only marks that identifier; the batch always completes.

use super::ContentIndex;
use crate::engine::updater::ModuleSlot;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of one batch: identifier → bytes or missing, in request order
#[derive(Debug, Clone, Default)]
pub struct ModuleReport {
    pub order: Vec<String>,
    pub slots: BTreeMap<String, ModuleSlot>,
}

impl ModuleReport {
    pub fn missing(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| matches!(self.slots.get(id.as_str()), Some(ModuleSlot::Missing) | None))
            .map(String::as_str)
            .collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, ModuleSlot::Loaded { .. }))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ModuleLoader {
    sandbox: PathBuf,
    builtin_root: PathBuf,
    package: String,
}

impl ModuleLoader {
    pub fn new(sandbox: PathBuf, builtin_root: PathBuf, package: impl Into<String>) -> Self {
        Self {
            sandbox,
            builtin_root,
            package: package.into(),
        }
    }

    /// Directories searched after an index miss, in order
    pub fn fallback_dirs(&self) -> [PathBuf; 6] {
        [
            self.sandbox.clone(),
            self.sandbox.join("Resources"),
            self.sandbox.join(&self.package),
            self.builtin_root.clone(),
            self.builtin_root.join("Resources"),
            self.builtin_root.join(&self.package),
        ]
    }

    /// Load every identifier. Blocking; run off the scheduler.
    pub fn load_all(&self, index: Option<&ContentIndex>, ids: &[String]) -> ModuleReport {
        let mut report = ModuleReport::default();
        for id in ids {
            let slot = match self.load_one(index, id) {
                Ok(Some((bytes, source))) => {
                    debug!(module = %id, source = %source.display(), size = bytes.len(), "module loaded");
                    ModuleSlot::Loaded { bytes, source }
                }
                Ok(None) => {
                    warn!(module = %id, "module not found in any location");
                    ModuleSlot::Missing
                }
                Err(e) => {
                    warn!(module = %id, error = %e, "module read failed");
                    ModuleSlot::Missing
                }
            };
            report.order.push(id.clone());
            report.slots.insert(id.clone(), slot);
        }
        report
    }

    fn load_one(&self, index: Option<&ContentIndex>, id: &str) -> io::Result<Option<(Vec<u8>, PathBuf)>> {
        if let Some(index) = index {
            match index.read(id) {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) => debug!(module = id, error = %e, "content index lookup failed"),
            }
        }

        let file_name = Path::new(id).file_name().unwrap_or(id.as_ref());
        for dir in self.fallback_dirs() {
            let candidate = dir.join(file_name);
            if candidate.is_file() {
                return Ok(Some((fs::read(&candidate)?, candidate)));
            }
        }

        match find_recursive(&self.sandbox, file_name)? {
            Some(path) => Ok(Some((fs::read(&path)?, path))),
            None => Ok(None),
        }
    }
}

/// First file named `name` below `dir`, depth-first in sorted order
fn find_recursive(dir: &Path, name: &std::ffi::OsStr) -> io::Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if let Some(found) = find_recursive(&path, name)? {
                return Ok(Some(found));
            }
        } else if file_type.is_file() && entry.file_name() == name {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ModuleLoader {
        ModuleLoader::new(dir.join("sandbox"), dir.join("builtin"), "DefaultPackage")
    }

    #[test]
    fn test_third_fallback_location() {
        let dir = tempdir().unwrap();
        let loader = loader(dir.path());
        let third = &loader.fallback_dirs()[2];
        fs::create_dir_all(third).unwrap();
        fs::write(third.join("HotUpdate.dll"), b"third").unwrap();

        let report = loader.load_all(None, &["HotUpdate.dll".to_string()]);
        assert_eq!(report.slots["HotUpdate.dll"].bytes(), Some(&b"third"[..]));
        assert!(report.missing().is_empty());
    }

    #[test]
    fn test_missing_does_not_abort_batch() {
        let dir = tempdir().unwrap();
        let loader = loader(dir.path());
        fs::create_dir_all(dir.path().join("builtin/Resources")).unwrap();
        fs::write(dir.path().join("builtin/Resources/AOT.dll"), b"aot").unwrap();

        let ids = vec!["Ghost.dll".to_string(), "AOT.dll".to_string()];
        let report = loader.load_all(None, &ids);

        assert_eq!(report.missing(), vec!["Ghost.dll"]);
        assert_eq!(report.loaded_count(), 1);
        assert_eq!(report.order, ids);
    }

    #[test]
    fn test_recursive_search_under_sandbox() {
        let dir = tempdir().unwrap();
        let loader = loader(dir.path());
        let deep = dir.path().join("sandbox/a/b/c");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("Deep.dll"), b"deep").unwrap();

        let report = loader.load_all(None, &["Deep.dll".to_string()]);
        assert_eq!(report.slots["Deep.dll"].bytes(), Some(&b"deep"[..]));
    }

    #[test]
    fn test_sandbox_wins_over_builtin() {
        let dir = tempdir().unwrap();
        let loader = loader(dir.path());
        for root in ["sandbox", "builtin"] {
            let path = dir.path().join(root);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join("HotUpdate.dll"), root).unwrap();
        }

        let report = loader.load_all(None, &["HotUpdate.dll".to_string()]);
        assert_eq!(report.slots["HotUpdate.dll"].bytes(), Some(&b"sandbox"[..]));
    }
}

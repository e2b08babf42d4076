//! Firmware image catalog on local disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::types::{FirmwareImage, UpgradeError};
use super::version::{version_from_file_name, FirmwareVersion};
use crate::snapshot::sha256_hex;

/// Images live at `<root>/<major>.x/<vendor-prefix>-<version>.tgz`.
pub struct FirmwareCatalog {
    root: PathBuf,
    checksums: Mutex<HashMap<PathBuf, String>>,
}

impl FirmwareCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            checksums: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scan_dir(dir: &Path, major_dir: &str) -> Result<Vec<FirmwareImage>, UpgradeError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpgradeError::Catalog(format!("{}: {}", dir.display(), e))),
        };

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| UpgradeError::Catalog(e.to_string()))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if !file_name.ends_with(".tgz") {
                continue;
            }
            let Some(version) = version_from_file_name(&file_name) else {
                debug!(file = %file_name, "Skipping image without a version");
                continue;
            };
            let metadata = entry
                .metadata()
                .map_err(|e| UpgradeError::Catalog(e.to_string()))?;
            if !metadata.is_file() {
                continue;
            }
            images.push(FirmwareImage {
                version,
                file_name,
                path: entry.path(),
                size_bytes: metadata.len(),
                major_dir: major_dir.to_string(),
            });
        }
        Ok(images)
    }

    /// Every image in the catalog, newest version first.
    pub fn list(&self) -> Result<Vec<FirmwareImage>, UpgradeError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(root = %self.root.display(), "Firmware directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(UpgradeError::Catalog(e.to_string())),
        };

        let mut images = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| UpgradeError::Catalog(e.to_string()))?;
            if !entry.path().is_dir() {
                continue;
            }
            let major_dir = entry.file_name().to_string_lossy().to_string();
            images.extend(Self::scan_dir(&entry.path(), &major_dir)?);
        }

        images.sort_by(|a, b| {
            let va = FirmwareVersion::parse(&a.version);
            let vb = FirmwareVersion::parse(&b.version);
            vb.cmp(&va).then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(images)
    }

    /// The image for exactly `version`, looked up in its major directory.
    pub fn find(&self, version: &str) -> Result<Option<FirmwareImage>, UpgradeError> {
        let parsed = FirmwareVersion::parse(version)
            .ok_or_else(|| UpgradeError::InvalidVersion(version.to_string()))?;
        let major_dir = parsed.major_dir();
        let mut matches: Vec<FirmwareImage> = Self::scan_dir(&self.root.join(&major_dir), &major_dir)?
            .into_iter()
            .filter(|image| image.version == version)
            .collect();
        matches.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(matches.into_iter().next())
    }

    /// SHA-256 of the image file, computed once per path.
    pub async fn checksum(&self, image: &FirmwareImage) -> Result<String, UpgradeError> {
        if let Some(sum) = self.checksums.lock().unwrap().get(&image.path) {
            return Ok(sum.clone());
        }

        let path = image.path.clone();
        let sum = tokio::task::spawn_blocking(move || fs::read(&path).map(|bytes| sha256_hex(&bytes)))
            .await
            .map_err(|e| UpgradeError::Catalog(format!("checksum task failed: {}", e)))?
            .map_err(|e| UpgradeError::Catalog(format!("{}: {}", image.path.display(), e)))?;

        self.checksums
            .lock()
            .unwrap()
            .insert(image.path.clone(), sum.clone());
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stage(root: &Path, major: &str, file_name: &str, bytes: &[u8]) {
        let dir = root.join(major);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file_name), bytes).unwrap();
    }

    #[test]
    fn test_list_newest_first() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), "21.x", "junos-srxsme-21.4R3-S5.tgz", b"a");
        stage(dir.path(), "23.x", "junos-srxsme-23.4R2.13.tgz", b"bb");
        stage(dir.path(), "23.x", "junos-srxsme-23.4R2.9.tgz", b"ccc");
        stage(dir.path(), "23.x", "release-notes.txt", b"x");

        let catalog = FirmwareCatalog::new(dir.path());
        let versions: Vec<String> = catalog.list().unwrap().into_iter().map(|i| i.version).collect();
        assert_eq!(versions, vec!["23.4R2.13", "23.4R2.9", "21.4R3-S5"]);
    }

    #[test]
    fn test_find_exact_version() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), "23.x", "junos-srxsme-23.4R2.13.tgz", b"image");
        let catalog = FirmwareCatalog::new(dir.path());

        let image = catalog.find("23.4R2.13").unwrap().unwrap();
        assert_eq!(image.size_bytes, 5);
        assert_eq!(image.major_dir, "23.x");
        assert!(catalog.find("23.4R2.1").unwrap().is_none());
        assert!(catalog.find("24.1R1").unwrap().is_none());
        assert!(matches!(
            catalog.find("latest"),
            Err(UpgradeError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let catalog = FirmwareCatalog::new("/nonexistent/firmware");
        assert!(catalog.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checksum_is_cached() {
        let dir = TempDir::new().unwrap();
        stage(dir.path(), "23.x", "junos-srxsme-23.4R2.13.tgz", b"image");
        let catalog = FirmwareCatalog::new(dir.path());
        let image = catalog.find("23.4R2.13").unwrap().unwrap();

        let first = catalog.checksum(&image).await.unwrap();
        assert_eq!(first, sha256_hex(b"image"));

        // Changing the file does not change the cached answer.
        fs::write(&image.path, b"tampered").unwrap();
        assert_eq!(catalog.checksum(&image).await.unwrap(), first);
    }
}

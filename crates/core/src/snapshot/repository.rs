//! Append-only content repository.
//!
//! Layout under the repository root:
//!
//! ```text
//! objects/ab/cdef...           blob, named by the SHA-256 of its bytes
//! <region>/<site>/<host>.log   one JSON commit record per line
//! ```
//!
//! Blobs are written once and never rewritten. Commit logs are only ever
//! appended to, and each record names its parent, so a device's history is
//! a linear chain that can be replayed from the log alone.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::store::SnapshotError;

/// One entry in a device commit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    pub parent: Option<String>,
    pub blob: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

pub struct ContentRepository {
    root: PathBuf,
    /// Serializes appends so parent links stay linear.
    log_lock: Mutex<()>,
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn is_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "_unassigned".to_string()
    } else {
        trimmed.to_string()
    }
}

impl ContentRepository {
    /// Open a repository at `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        Ok(Self {
            root,
            log_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative log path for a `[region, site, hostname]` key.
    pub fn log_path(location: &[String; 3]) -> String {
        format!(
            "{}/{}/{}.log",
            sanitize_component(&location[0]),
            sanitize_component(&location[1]),
            sanitize_component(&location[2])
        )
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf, SnapshotError> {
        if !is_hash(hash) {
            return Err(SnapshotError::Corrupt {
                id: hash.to_string(),
                reason: "not a sha256 object name".to_string(),
            });
        }
        Ok(self.root.join("objects").join(&hash[..2]).join(&hash[2..]))
    }

    /// Store `bytes` and return their hash. Existing blobs are left untouched.
    pub fn write_blob(&self, bytes: &[u8]) -> Result<String, SnapshotError> {
        let hash = sha256_hex(bytes);
        let path = self.blob_path(&hash)?;
        if path.exists() {
            return Ok(hash);
        }

        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;

        // Write under a temporary name and rename, so a crash never leaves a
        // truncated object under its final name.
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        debug!(hash = %hash, size = bytes.len(), "Stored blob");
        Ok(hash)
    }

    pub fn read_blob(&self, hash: &str) -> Result<Vec<u8>, SnapshotError> {
        let path = self.blob_path(hash)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SnapshotError::Corrupt {
                id: hash.to_string(),
                reason: "blob missing from repository".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Append a commit for `blob` to the log at `log_path`.
    pub fn commit(
        &self,
        log_path: &str,
        blob: &str,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<CommitRecord, SnapshotError> {
        let _guard = self.log_lock.lock().unwrap();

        let full_path = self.root.join(log_path);
        if let Some(dir) = full_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let parent = self.read_log(&full_path)?.pop().map(|c| c.id);

        let mut hasher = Sha256::new();
        hasher.update(parent.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\n");
        hasher.update(blob.as_bytes());
        hasher.update(b"\n");
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(b"\n");
        hasher.update(message.as_bytes());

        let record = CommitRecord {
            id: format!("{:x}", hasher.finalize()),
            parent,
            blob: blob.to_string(),
            timestamp,
            message: message.to_string(),
        };

        let mut line =
            serde_json::to_string(&record).map_err(|e| SnapshotError::Io(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full_path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        Ok(record)
    }

    /// All commits in the log at `log_path`, oldest first.
    pub fn log(&self, log_path: &str) -> Result<Vec<CommitRecord>, SnapshotError> {
        self.read_log(&self.root.join(log_path))
    }

    fn read_log(&self, path: &Path) -> Result<Vec<CommitRecord>, SnapshotError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| SnapshotError::Corrupt {
                    id: path.display().to_string(),
                    reason: format!("unreadable commit record: {}", e),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn location(region: &str, site: &str, host: &str) -> [String; 3] {
        [region.to_string(), site.to_string(), host.to_string()]
    }

    #[test]
    fn test_blob_round_trip_and_dedup() {
        let dir = TempDir::new().unwrap();
        let repo = ContentRepository::open(dir.path()).unwrap();

        let a = repo.write_blob(b"set system host-name srx-1\n").unwrap();
        let b = repo.write_blob(b"set system host-name srx-1\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(repo.read_blob(&a).unwrap(), b"set system host-name srx-1\n");

        let object = dir.path().join("objects").join(&a[..2]).join(&a[2..]);
        assert!(object.exists());
    }

    #[test]
    fn test_empty_blob() {
        let dir = TempDir::new().unwrap();
        let repo = ContentRepository::open(dir.path()).unwrap();
        let hash = repo.write_blob(b"").unwrap();
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(repo.read_blob(&hash).unwrap().is_empty());
    }

    #[test]
    fn test_read_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let repo = ContentRepository::open(dir.path()).unwrap();
        assert!(matches!(
            repo.read_blob("../../etc/passwd"),
            Err(SnapshotError::Corrupt { .. })
        ));
        let missing = sha256_hex(b"never stored");
        assert!(matches!(
            repo.read_blob(&missing),
            Err(SnapshotError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_log_path_sanitizes_components() {
        assert_eq!(
            ContentRepository::log_path(&location("emea", "ams-1", "srx-42")),
            "emea/ams-1/srx-42.log"
        );
        assert_eq!(
            ContentRepository::log_path(&location("", "..", "a/b c")),
            "_unassigned/_unassigned/a_b_c.log"
        );
    }

    #[test]
    fn test_commits_chain_to_parent() {
        let dir = TempDir::new().unwrap();
        let repo = ContentRepository::open(dir.path()).unwrap();
        let path = ContentRepository::log_path(&location("emea", "ams", "srx-1"));

        let blob = repo.write_blob(b"v1").unwrap();
        let first = repo.commit(&path, &blob, "first", Utc::now()).unwrap();
        assert!(first.parent.is_none());

        let blob2 = repo.write_blob(b"v2").unwrap();
        let second = repo
            .commit(&path, &blob2, "multi\nline \"message\"", Utc::now())
            .unwrap();
        assert_eq!(second.parent.as_deref(), Some(first.id.as_str()));
        assert_ne!(first.id, second.id);

        let log = repo.log(&path).unwrap();
        assert_eq!(log, vec![first, second]);
    }

    #[test]
    fn test_separate_devices_have_separate_logs() {
        let dir = TempDir::new().unwrap();
        let repo = ContentRepository::open(dir.path()).unwrap();
        let blob = repo.write_blob(b"same").unwrap();

        let a = ContentRepository::log_path(&location("r", "s", "a"));
        let b = ContentRepository::log_path(&location("r", "s", "b"));
        repo.commit(&a, &blob, "a", Utc::now()).unwrap();
        let first_b = repo.commit(&b, &blob, "b", Utc::now()).unwrap();

        assert!(first_b.parent.is_none());
        assert_eq!(repo.log(&a).unwrap().len(), 1);
        assert!(repo.log("r/s/none.log").unwrap().is_empty());
    }
}

//! Remembers which program binary is attached where.
//!
//! One JSON record per `(interface, program)` pair, keyed by the sha256
//! of the program bytes. On restart the reconciler compares the record
//! against the freshly built program and skips the attachment when they
//! match; classifier programs assemble deterministically to make that
//! comparison meaningful.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedProgInfo {
    #[serde(rename = "Name")]
    pub name: String,
    /// Hex sha256 of the program binary.
    #[serde(rename = "Hash")]
    pub hash: String,
}

/// Attachment records in a per-host directory.
#[derive(Clone, Debug)]
pub struct AttachStore {
    dir: PathBuf,
}

/// Hex sha256 of a program's instruction bytes.
pub fn program_hash(program: &[u8]) -> String {
    let digest = Sha256::digest(program);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

// === impl AttachStore ===

impl AttachStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Whether the recorded attachment for this site already carries
    /// `hash`. Unreadable or corrupt records read as "not attached".
    pub fn is_attached(&self, iface: &str, prog_name: &str, hash: &str) -> bool {
        match self.read(iface, prog_name) {
            Ok(Some(info)) => info.hash == hash,
            Ok(None) => false,
            Err(error) => {
                tracing::info!(%iface, %prog_name, %error, "ignoring unreadable attach record");
                false
            }
        }
    }

    pub fn read(&self, iface: &str, prog_name: &str) -> Result<Option<AttachedProgInfo>> {
        let path = self.record_path(iface, prog_name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let info = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(info))
    }

    /// Rewrites the record for an attachment site.
    pub fn record(&self, iface: &str, prog_name: &str, hash: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;

        let info = AttachedProgInfo {
            name: prog_name.to_string(),
            hash: hash.to_string(),
        };
        let path = self.record_path(iface, prog_name);
        // Records are written read-only; drop any previous one first.
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
        }
        fs::write(&path, serde_json::to_vec(&info)?)
            .with_context(|| format!("writing {}", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o400))
            .with_context(|| format!("restricting {}", path.display()))?;
        fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {}", self.dir.display()))?;
        Ok(())
    }

    pub fn forget(&self, iface: &str, prog_name: &str) -> Result<()> {
        let path = self.record_path(iface, prog_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn record_path(&self, iface: &str, prog_name: &str) -> PathBuf {
        Path::new(&self.dir).join(format!("{iface}_{prog_name}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        let h = program_hash(b"prog");
        assert_eq!(h.len(), 64);
        assert_eq!(h, program_hash(b"prog"));
        assert_ne!(h, program_hash(b"other"));
    }

    #[test]
    fn record_round_trips_and_gates_reattachment() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachStore::new(dir.path().join("bpf"));
        let hash = program_hash(b"program-bytes");

        assert!(!store.is_attached("eth0", "ingress", &hash));
        store.record("eth0", "ingress", &hash).unwrap();
        assert!(store.is_attached("eth0", "ingress", &hash));
        assert!(!store.is_attached("eth0", "ingress", &program_hash(b"new")));

        // Rewriting with a new hash replaces the read-only record.
        let hash2 = program_hash(b"new");
        store.record("eth0", "ingress", &hash2).unwrap();
        assert!(store.is_attached("eth0", "ingress", &hash2));

        store.forget("eth0", "ingress").unwrap();
        assert!(!store.is_attached("eth0", "ingress", &hash2));
    }

    #[test]
    fn record_files_are_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = AttachStore::new(dir.path().join("bpf"));
        store
            .record("eth0", "ingress", &program_hash(b"x"))
            .unwrap();

        let path = dir.path().join("bpf").join("eth0_ingress.json");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
    }
}

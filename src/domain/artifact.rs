//! Artifacts produced by build steps.
//!
//! An artifact is a single compiled binary. Signing may rewrite it in place or
//! move it, but `build_path` always points at what the builder produced.

use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A binary produced by a build step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Artifact name (the binary name, without platform suffix)
    pub name: String,

    /// Current location of the artifact
    pub path: PathBuf,

    /// Original build output location
    pub build_path: PathBuf,

    /// Name of the step that produced this artifact
    pub produced_by: String,

    /// Hex SHA-256 of the file at `path`
    pub sha256: String,

    pub size_bytes: u64,

    /// Set once a signer has processed the artifact
    pub signature: Option<SignatureInfo>,

    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Describe a freshly built file, hashing its contents
    pub fn from_build_output(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        produced_by: impl Into<String>,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let (sha256, size_bytes) = hash_file(&path)?;

        Ok(Self {
            name: name.into(),
            build_path: path.clone(),
            path,
            produced_by: produced_by.into(),
            sha256,
            size_bytes,
            signature: None,
            created_at: Utc::now(),
        })
    }

    /// Whether a signer has processed this artifact
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// File name of the artifact as it should appear in a package
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.name.clone())
    }

    /// Record a signature, rehashing the file since signers may rewrite it
    pub fn into_signed(mut self, signature: SignatureInfo) -> std::io::Result<Self> {
        let (sha256, size_bytes) = hash_file(&self.path)?;
        self.sha256 = sha256;
        self.size_bytes = size_bytes;
        self.signature = Some(signature);
        Ok(self)
    }
}

/// How an artifact was signed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    /// Signature scheme, e.g. `Ed25519` or `external`
    pub algorithm: String,

    /// Detached signature file, when the scheme produces one
    pub signature_path: Option<PathBuf>,

    /// Fingerprint of the signing identity (never the key itself)
    pub key_fingerprint: Option<String>,

    pub signed_at: DateTime<Utc>,
}

/// Hash a file with SHA-256, returning the hex digest and its size
pub fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_from_build_output() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.exe");
        std::fs::write(&path, b"MZ binary").unwrap();

        let artifact = Artifact::from_build_output("app", &path, "build").unwrap();

        assert_eq!(artifact.name, "app");
        assert_eq!(artifact.file_name(), "app.exe");
        assert_eq!(artifact.size_bytes, 9);
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(artifact.build_path, path);
        assert!(!artifact.is_signed());
    }

    #[test]
    fn test_signing_keeps_build_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app");
        std::fs::write(&path, b"unsigned").unwrap();
        let artifact = Artifact::from_build_output("app", &path, "build").unwrap();
        let before = artifact.sha256.clone();

        std::fs::write(&path, b"signed contents").unwrap();
        let signed = artifact
            .into_signed(SignatureInfo {
                algorithm: "external".to_string(),
                signature_path: None,
                key_fingerprint: None,
                signed_at: Utc::now(),
            })
            .unwrap();

        assert!(signed.is_signed());
        assert_eq!(signed.build_path, path);
        assert_ne!(signed.sha256, before);
    }

    #[test]
    fn test_missing_file_errors() {
        let temp = TempDir::new().unwrap();
        assert!(Artifact::from_build_output("x", temp.path().join("nope"), "build").is_err());
    }
}

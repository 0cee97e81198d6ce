//! Artifact signing.
//!
//! Two signers are provided:
//! - [`KeySigner`]: Ed25519 detached signatures (`<file>.sig`, base64)
//! - [`CommandSigner`]: an external signing tool such as `osslsigncode`
//!   or `signtool`, rewriting the binary in place
//!
//! Both hold their credential as a [`Secret`] handed over at construction.
//! The credential is never returned, logged or written to step outputs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::domain::{Artifact, SignatureInfo};
use crate::secrets::Secret;

use super::process::{exit_label, run_captured, tail};
use super::Signer;

/// Signature algorithm identifier for [`KeySigner`]
pub const SIGNATURE_ALGORITHM: &str = "Ed25519";

/// Extension appended to detached signature files
pub const SIGNATURE_EXTENSION: &str = "sig";

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signing credential: {0}")]
    InvalidCredential(String),

    #[error("signing with {tool} failed: {detail}")]
    Service { tool: String, detail: String },

    #[error("artifact to sign does not exist: {0}")]
    MissingArtifact(PathBuf),

    #[error("invalid signature for {0}")]
    InvalidSignature(PathBuf),

    #[error("I/O error while signing: {0}")]
    Io(#[from] std::io::Error),
}

/// Ed25519 signer producing detached signatures
pub struct KeySigner {
    key: SigningKey,
}

impl KeySigner {
    /// Load the key from a base64-encoded 32-byte seed
    pub fn from_secret(secret: &Secret) -> Result<Self, SigningError> {
        let bytes = BASE64
            .decode(secret.expose().trim())
            .map_err(|_| SigningError::InvalidCredential("key is not valid base64".to_string()))?;

        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            SigningError::InvalidCredential(format!(
                "expected a 32-byte Ed25519 seed, got {} bytes",
                bytes.len()
            ))
        })?;

        Ok(Self {
            key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// SHA-256 fingerprint of the public key (hex)
    pub fn fingerprint(&self) -> String {
        key_fingerprint(&self.verifying_key())
    }

    async fn sign_one(&self, artifact: &Artifact) -> Result<Artifact, SigningError> {
        let contents = read_artifact(&artifact.path).await?;
        let signature = self.key.sign(&contents);

        let signature_path = signature_path_for(&artifact.path);
        tokio::fs::write(&signature_path, BASE64.encode(signature.to_bytes())).await?;

        debug!(artifact = %artifact.name, signature = %signature_path.display(), "Wrote signature");

        Ok(artifact.clone().into_signed(SignatureInfo {
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            signature_path: Some(signature_path),
            key_fingerprint: Some(self.fingerprint()),
            signed_at: Utc::now(),
        })?)
    }
}

#[async_trait]
impl Signer for KeySigner {
    fn name(&self) -> &str {
        "ed25519"
    }

    async fn sign(&self, artifacts: &[Artifact]) -> Result<Vec<Artifact>, SigningError> {
        let mut signed = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            signed.push(self.sign_one(artifact).await?);
        }
        info!(count = signed.len(), fingerprint = %self.fingerprint(), "Signed artifacts");
        Ok(signed)
    }
}

/// Signer that shells out to an external code-signing tool.
///
/// `{file}` in `args` is replaced by the artifact path. The credential is
/// exported to the child process only, under `credential_env`.
pub struct CommandSigner {
    program: String,
    args: Vec<String>,
    credential: Secret,
    credential_env: String,
}

impl CommandSigner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        credential: Secret,
        credential_env: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            credential,
            credential_env: credential_env.into(),
        }
    }

    fn args_for(&self, path: &Path) -> Vec<String> {
        let file = path.to_string_lossy();
        self.args.iter().map(|a| a.replace("{file}", &file)).collect()
    }
}

#[async_trait]
impl Signer for CommandSigner {
    fn name(&self) -> &str {
        &self.program
    }

    async fn sign(&self, artifacts: &[Artifact]) -> Result<Vec<Artifact>, SigningError> {
        let mut signed = Vec::with_capacity(artifacts.len());

        for artifact in artifacts {
            if !artifact.path.is_file() {
                return Err(SigningError::MissingArtifact(artifact.path.clone()));
            }

            let mut command = Command::new(&self.program);
            command
                .args(self.args_for(&artifact.path))
                .env(&self.credential_env, self.credential.expose());

            let output = run_captured(&mut command)
                .await
                .map_err(|e| SigningError::Service {
                    tool: self.program.clone(),
                    detail: e.to_string(),
                })?;

            if !output.status.success() {
                return Err(SigningError::Service {
                    tool: self.program.clone(),
                    detail: format!("{}: {}", exit_label(&output), tail(&output.stderr, 10)),
                });
            }

            signed.push(artifact.clone().into_signed(SignatureInfo {
                algorithm: "external".to_string(),
                signature_path: None,
                key_fingerprint: None,
                signed_at: Utc::now(),
            })?);
        }

        info!(count = signed.len(), tool = %self.program, "Signed artifacts");
        Ok(signed)
    }
}

/// `<path>.sig`
pub fn signature_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(SIGNATURE_EXTENSION);
    PathBuf::from(name)
}

/// Hex SHA-256 of a public key
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a detached signature written by [`KeySigner`]
pub fn verify_detached(
    path: &Path,
    signature_path: &Path,
    key: &VerifyingKey,
) -> Result<(), SigningError> {
    let contents = std::fs::read(path)?;
    let encoded = std::fs::read_to_string(signature_path)?;

    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| SigningError::InvalidSignature(path.to_path_buf()))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|_| SigningError::InvalidSignature(path.to_path_buf()))?;

    key.verify(&contents, &signature)
        .map_err(|_| SigningError::InvalidSignature(path.to_path_buf()))
}

async fn read_artifact(path: &Path) -> Result<Vec<u8>, SigningError> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(SigningError::MissingArtifact(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

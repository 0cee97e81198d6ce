//! Packaging artifacts into a deterministic `.tar.gz`.
//!
//! Layout inside the archive:
//!
//! ```text
//! manifest.json
//! bin/<artifact file>
//! bin/<artifact file>.sig   (detached signatures, when present)
//! ```
//!
//! Entries are sorted and written with zeroed mtime/uid/gid so identical
//! inputs produce an identical archive hash.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder as TarBuilder, Header};
use thiserror::Error;
use tracing::info;

use crate::core::SafetyLimits;
use crate::domain::package::{archive_file_name, BIN_DIR, MANIFEST_FILE};
use crate::domain::{hash_file, Artifact, ManifestEntry, Package, PackageManifest, ReleaseCoordinates};

use super::Packager;

/// Everything needed to produce one package
#[derive(Debug, Clone)]
pub struct PackageRequest {
    /// Step requesting the package (recorded on the package)
    pub step_name: String,

    pub package_id: String,

    pub release: ReleaseCoordinates,

    pub artifacts: Vec<Artifact>,

    /// Directory the package layout is assembled in (recreated)
    pub staging_dir: PathBuf,

    /// Directory the archive is written to
    pub output_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("no artifacts to package")]
    NoArtifacts,

    #[error("expected artifact '{name}' is missing: {path}")]
    MissingArtifact { name: String, path: PathBuf },

    #[error("refusing to package '{0}': matches the secret denylist")]
    Denylisted(String),

    #[error("failed to write manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("I/O error while packaging: {0}")]
    Io(#[from] io::Error),
}

/// Packager producing gzip-compressed tarballs
pub struct TarballPackager {
    limits: SafetyLimits,
}

impl Default for TarballPackager {
    fn default() -> Self {
        Self::new()
    }
}

impl TarballPackager {
    pub fn new() -> Self {
        Self::with_limits(SafetyLimits::default())
    }

    /// Use custom limits (the denylist applies to staged file names)
    pub fn with_limits(limits: SafetyLimits) -> Self {
        Self { limits }
    }

    /// Copy artifacts into `bin/` of the staging directory and write the
    /// manifest. Returns the manifest.
    pub fn stage(&self, request: &PackageRequest) -> Result<PackageManifest, PackagingError> {
        if request.artifacts.is_empty() {
            return Err(PackagingError::NoArtifacts);
        }

        if request.staging_dir.exists() {
            fs::remove_dir_all(&request.staging_dir)?;
        }
        let bin_dir = request.staging_dir.join(BIN_DIR);
        fs::create_dir_all(&bin_dir)?;

        let mut manifest = PackageManifest::new(&request.package_id, &request.release);

        for artifact in &request.artifacts {
            if !artifact.path.is_file() {
                return Err(PackagingError::MissingArtifact {
                    name: artifact.name.clone(),
                    path: artifact.path.clone(),
                });
            }

            let file_name = artifact.file_name();
            self.check_denylist(&file_name)?;
            fs::copy(&artifact.path, bin_dir.join(&file_name))?;

            let mut signature_path = None;
            if let Some(sig) = artifact
                .signature
                .as_ref()
                .and_then(|s| s.signature_path.as_ref())
            {
                let sig_name = format!("{}.sig", file_name);
                fs::copy(sig, bin_dir.join(&sig_name))?;
                signature_path = Some(format!("{}/{}", BIN_DIR, sig_name));
            }

            manifest.artifacts.push(ManifestEntry {
                name: artifact.name.clone(),
                path: format!("{}/{}", BIN_DIR, file_name),
                sha256: artifact.sha256.clone(),
                signed: artifact.is_signed(),
                signature_path,
            });
        }

        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(request.staging_dir.join(MANIFEST_FILE), manifest_json)?;

        Ok(manifest)
    }

    /// Archive a staged directory. Every artifact the manifest declares must
    /// be present in the staging directory.
    pub fn archive(
        &self,
        staging_dir: &Path,
        manifest: &PackageManifest,
        output_dir: &Path,
    ) -> Result<PathBuf, PackagingError> {
        for entry in &manifest.artifacts {
            let staged = staging_dir.join(&entry.path);
            if !staged.is_file() {
                return Err(PackagingError::MissingArtifact {
                    name: entry.name.clone(),
                    path: staged,
                });
            }
        }

        let mut files = collect_files(staging_dir)?;
        files.sort();

        fs::create_dir_all(output_dir)?;
        let archive_path = output_dir.join(archive_file_name(manifest));

        // Write to a temp file first so a failed run never leaves a
        // half-written archive under the final name
        let temp = tempfile::NamedTempFile::new_in(output_dir)?;
        {
            let encoder = GzEncoder::new(temp.as_file(), Compression::default());
            let mut builder = TarBuilder::new(encoder);

            for rel_path in &files {
                let contents = fs::read(staging_dir.join(rel_path))?;

                let mut header = Header::new_gnu();
                header.set_path(rel_path)?;
                header.set_size(contents.len() as u64);
                header.set_mtime(0);
                header.set_uid(0);
                header.set_gid(0);
                header.set_mode(if rel_path.starts_with(BIN_DIR) && !is_signature(rel_path) {
                    0o755
                } else {
                    0o644
                });
                header.set_cksum();

                builder.append(&header, contents.as_slice())?;
            }

            let mut encoder = builder.into_inner()?;
            encoder.flush()?;
            encoder.finish()?;
        }

        temp.persist(&archive_path).map_err(|e| e.error)?;
        Ok(archive_path)
    }

    fn check_denylist(&self, file_name: &str) -> Result<(), PackagingError> {
        if self.limits.is_denylisted(file_name) {
            return Err(PackagingError::Denylisted(file_name.to_string()));
        }
        Ok(())
    }

    fn package_blocking(&self, request: &PackageRequest) -> Result<Package, PackagingError> {
        let manifest = self.stage(request)?;
        let path = self.archive(&request.staging_dir, &manifest, &request.output_dir)?;
        let (sha256, size_bytes) = hash_file(&path)?;

        info!(
            package = %path.display(),
            %sha256,
            artifacts = manifest.artifacts.len(),
            "Package created"
        );

        Ok(Package {
            path,
            sha256,
            size_bytes,
            manifest,
            produced_by: request.step_name.clone(),
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Packager for TarballPackager {
    fn name(&self) -> &str {
        "tar.gz"
    }

    async fn package(&self, request: &PackageRequest) -> Result<Package, PackagingError> {
        let packager = Self::with_limits(self.limits.clone());
        let request = request.clone();

        tokio::task::spawn_blocking(move || packager.package_blocking(&request))
            .await
            .map_err(|e| PackagingError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }
}

/// Relative paths (with `/` separators) of all files under `root`
fn collect_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                files.push(rel);
            }
        }
    }

    Ok(files)
}

fn is_signature(path: &str) -> bool {
    path.ends_with(".sig")
}

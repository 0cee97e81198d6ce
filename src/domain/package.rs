//! Packages: compressed archives of artifacts plus a manifest.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::release::ReleaseCoordinates;

/// File name of the manifest inside every package
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory inside the package holding the binaries
pub const BIN_DIR: &str = "bin";

/// A distributable archive. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// Path to the `.tar.gz` archive
    pub path: PathBuf,

    /// Hex SHA-256 of the archive (content identifier)
    pub sha256: String,

    pub size_bytes: u64,

    pub manifest: PackageManifest,

    /// Name of the step that produced this package
    pub produced_by: String,

    pub created_at: DateTime<Utc>,
}

impl Package {
    /// Number of bundled artifacts that were signed before packaging
    pub fn signed_artifact_count(&self) -> usize {
        self.manifest.artifacts.iter().filter(|a| a.signed).count()
    }

    /// Archive file name
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| archive_file_name(&self.manifest))
    }
}

/// Manifest written as `manifest.json` at the package root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    pub package_id: String,
    pub version: String,
    pub platform: String,
    pub channel: String,
    pub artifacts: Vec<ManifestEntry>,
}

impl PackageManifest {
    pub fn new(package_id: impl Into<String>, release: &ReleaseCoordinates) -> Self {
        Self {
            package_id: package_id.into(),
            version: release.version.clone(),
            platform: release.platform.to_string(),
            channel: release.channel.clone(),
            artifacts: Vec::new(),
        }
    }

    /// Whether this manifest was built for the given release
    pub fn matches(&self, release: &ReleaseCoordinates) -> bool {
        self.version == release.version
            && self.platform == release.platform.as_str()
            && self.channel == release.channel
    }
}

/// One artifact inside a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,

    /// Path inside the archive, e.g. `bin/app.exe`
    pub path: String,

    pub sha256: String,

    pub signed: bool,

    /// Detached signature path inside the archive, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_path: Option<String>,
}

/// Archive name for a manifest: `<id>-<version>-<platform>.tar.gz`
pub fn archive_file_name(manifest: &PackageManifest) -> String {
    format!(
        "{}-{}-{}.tar.gz",
        manifest.package_id, manifest.version, manifest.platform
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(signed: &[bool]) -> PackageManifest {
        let release = ReleaseCoordinates::new("x86-windows", "1.2.3", "nightly").unwrap();
        let mut manifest = PackageManifest::new("tool", &release);
        for (i, s) in signed.iter().enumerate() {
            manifest.artifacts.push(ManifestEntry {
                name: format!("bin{}", i),
                path: format!("bin/bin{}.exe", i),
                sha256: "00".repeat(32),
                signed: *s,
                signature_path: None,
            });
        }
        manifest
    }

    #[test]
    fn test_archive_file_name() {
        let manifest = manifest_with(&[]);
        assert_eq!(
            archive_file_name(&manifest),
            "tool-1.2.3-x86-windows.tar.gz"
        );
    }

    #[test]
    fn test_signed_count() {
        let package = Package {
            path: PathBuf::from("/dist/tool.tar.gz"),
            sha256: String::new(),
            size_bytes: 0,
            manifest: manifest_with(&[true, false, true]),
            produced_by: "package".to_string(),
            created_at: Utc::now(),
        };
        assert_eq!(package.signed_artifact_count(), 2);
        assert_eq!(package.file_name(), "tool.tar.gz");
    }

    #[test]
    fn test_manifest_matches_release() {
        let manifest = manifest_with(&[true]);
        let same = ReleaseCoordinates::new("x86-windows", "1.2.3", "nightly").unwrap();
        let other = ReleaseCoordinates::new("x86-windows", "1.2.3", "stable").unwrap();
        assert!(manifest.matches(&same));
        assert!(!manifest.matches(&other));
    }
}

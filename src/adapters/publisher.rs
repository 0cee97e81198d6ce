//! Publishing packages to a registry.
//!
//! Registry protocol (HTTP):
//!
//! ```text
//! PUT {base}/packages/{package_id}/{platform}/{version}?channel={channel}
//! Authorization: Bearer <token>
//! Content-Type: application/gzip
//! X-Package-Sha256: <hex>
//! ```
//!
//! `2xx` is success, `409` a duplicate version, `401`/`403` an auth failure.
//! `file://` registries are plain directory trees, used for dry runs.
//!
//! A publisher only uploads to the registry it was built for. [`RegistryRouter`]
//! picks the publisher from each target's registry URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{check_path_segment, Package, ReleaseCoordinates};
use crate::secrets::Secret;

use super::Publisher;

/// Where and under which coordinates a package is published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// Registry URL (`https://...` or `file:///...`)
    pub registry: String,
    pub release: ReleaseCoordinates,
}

/// Confirmation returned by a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub url: String,
    pub package_id: String,
    pub platform: String,
    pub version: String,
    pub channel: String,
}

impl PublishReceipt {
    fn for_target(url: String, package: &Package, target: &PublishTarget) -> Self {
        Self {
            url,
            package_id: package.manifest.package_id.clone(),
            platform: target.release.platform.to_string(),
            version: target.release.version.clone(),
            channel: target.release.channel.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("package '{0}' contains no signed artifacts")]
    Unsigned(String),

    #[error("package manifest does not match publish target: {0}")]
    Mismatch(String),

    #[error("invalid publish coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("{package_id} {version} ({platform}, {channel}) is already published")]
    Conflict {
        package_id: String,
        version: String,
        platform: String,
        channel: String,
    },

    #[error("registry rejected credentials: {0}")]
    Unauthorized(String),

    #[error("network error while publishing: {0}")]
    Network(String),

    #[error("registry rejected upload with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unsupported registry URL '{0}'")]
    UnsupportedRegistry(String),

    #[error("publisher for {serves} cannot publish to {requested}")]
    WrongRegistry { serves: String, requested: String },

    #[error("I/O error while publishing: {0}")]
    Io(#[from] std::io::Error),
}

impl PublishError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Check the publish policy: at least one signed artifact, a manifest
/// tagged with the target's coordinates, and coordinates that are each a
/// single path segment.
pub fn ensure_publishable(package: &Package, target: &PublishTarget) -> Result<(), PublishError> {
    let segments = [
        ("package id", package.manifest.package_id.as_str()),
        ("platform", target.release.platform.as_str()),
        ("version", target.release.version.as_str()),
        ("release channel", target.release.channel.as_str()),
    ];
    for (what, value) in segments {
        check_path_segment(what, value)
            .map_err(|e| PublishError::InvalidCoordinate(e.to_string()))?;
    }

    if package.signed_artifact_count() == 0 {
        return Err(PublishError::Unsigned(package.manifest.package_id.clone()));
    }

    if !package.manifest.matches(&target.release) {
        return Err(PublishError::Mismatch(format!(
            "package is ({}, {}, {}), target is ({}, {}, {})",
            package.manifest.platform,
            package.manifest.version,
            package.manifest.channel,
            target.release.platform,
            target.release.version,
            target.release.channel,
        )));
    }

    Ok(())
}

/// Body returned by the registry on success (all fields optional)
#[derive(Debug, Deserialize)]
struct RegistryResponse {
    url: Option<String>,
}

/// HTTP registry publisher
pub struct RegistryPublisher {
    base_url: String,
    token: Secret,
    client: reqwest::Client,
}

impl RegistryPublisher {
    pub fn new(base_url: impl Into<String>, token: Secret) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        }
    }

    fn check_registry(&self, target: &PublishTarget) -> Result<(), PublishError> {
        if target.registry.trim_end_matches('/') != self.base_url {
            return Err(PublishError::WrongRegistry {
                serves: self.base_url.clone(),
                requested: target.registry.clone(),
            });
        }
        Ok(())
    }

    /// Upload URL for a package (without the channel query)
    pub fn upload_url(&self, package: &Package) -> String {
        format!(
            "{}/packages/{}/{}/{}",
            self.base_url,
            package.manifest.package_id,
            package.manifest.platform,
            package.manifest.version
        )
    }
}

fn conflict(package: &Package, target: &PublishTarget) -> PublishError {
    PublishError::Conflict {
        package_id: package.manifest.package_id.clone(),
        version: target.release.version.clone(),
        platform: target.release.platform.to_string(),
        channel: target.release.channel.clone(),
    }
}

/// Map a registry status code to the publish outcome
fn check_status(status: u16, body: &str, target: &PublishTarget, package: &Package) -> Result<(), PublishError> {
    match status {
        200..=299 => Ok(()),
        409 => Err(conflict(package, target)),
        401 | 403 => Err(PublishError::Unauthorized(format!("status {}", status))),
        _ => Err(PublishError::Rejected {
            status,
            body: body.chars().take(500).collect(),
        }),
    }
}

#[async_trait]
impl Publisher for RegistryPublisher {
    fn name(&self) -> &str {
        "registry"
    }

    async fn upload(
        &self,
        package: &Package,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, PublishError> {
        self.check_registry(target)?;

        let url = self.upload_url(package);
        let payload = tokio::fs::read(&package.path).await?;

        info!(%url, channel = %target.release.channel, bytes = payload.len(), "Uploading package");

        let response = self
            .client
            .put(&url)
            .query(&[("channel", target.release.channel.as_str())])
            .bearer_auth(self.token.expose())
            .header(reqwest::header::CONTENT_TYPE, "application/gzip")
            .header("X-Package-Sha256", &package.sha256)
            .body(payload)
            .send()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PublishError::Network(e.to_string()))?;

        check_status(status, &body, target, package)?;

        let published_url = serde_json::from_str::<RegistryResponse>(&body)
            .ok()
            .and_then(|r| r.url)
            .unwrap_or(url);

        Ok(PublishReceipt::for_target(published_url, package, target))
    }
}

/// Directory-backed registry:
/// `<root>/<package_id>/<channel>/<platform>/<version>/<archive>`
pub struct LocalRegistryPublisher {
    root: PathBuf,
}

impl LocalRegistryPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory a package is stored in
    pub fn package_dir(&self, package: &Package, target: &PublishTarget) -> PathBuf {
        self.root
            .join(&package.manifest.package_id)
            .join(&target.release.channel)
            .join(target.release.platform.as_str())
            .join(&target.release.version)
    }
}

#[async_trait]
impl Publisher for LocalRegistryPublisher {
    fn name(&self) -> &str {
        "local"
    }

    async fn upload(
        &self,
        package: &Package,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, PublishError> {
        let requested = target.registry.strip_prefix("file://").map(Path::new);
        if requested != Some(self.root.as_path()) {
            return Err(PublishError::WrongRegistry {
                serves: format!("file://{}", self.root.display()),
                requested: target.registry.clone(),
            });
        }

        let dir = self.package_dir(package, target);
        if dir.exists() {
            warn!(dir = %dir.display(), "Version already present in local registry");
            return Err(conflict(package, target));
        }

        // Assemble the entry beside its final location and rename it into
        // place, so a failed upload leaves nothing under the version path
        tokio::fs::create_dir_all(&self.root).await?;
        let staging = tempfile::Builder::new()
            .prefix(".upload-")
            .tempdir_in(&self.root)?;

        let file_name = package.file_name();
        tokio::fs::copy(&package.path, staging.path().join(&file_name)).await?;
        tokio::fs::write(
            staging.path().join("manifest.json"),
            serde_json::to_vec_pretty(&package.manifest)
                .map_err(|e| PublishError::Io(e.into()))?,
        )
        .await?;

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(staging.path(), &dir).await {
            if dir.exists() {
                return Err(conflict(package, target));
            }
            return Err(e.into());
        }

        let dest = dir.join(&file_name);
        info!(dest = %dest.display(), "Package stored in local registry");

        Ok(PublishReceipt::for_target(
            format!("file://{}", dest.display()),
            package,
            target,
        ))
    }
}

/// Publisher that picks the registry from each target.
///
/// Holds the registry token, if any; `file://` targets never see it.
pub struct RegistryRouter {
    token: Option<Secret>,
}

impl RegistryRouter {
    pub fn new(token: Option<Secret>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Publisher for RegistryRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn upload(
        &self,
        package: &Package,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, PublishError> {
        let publisher = publisher_for(&target.registry, self.token.clone())?;
        info!(registry = %target.registry, publisher = publisher.name(), "Routing upload");
        publisher.upload(package, target).await
    }
}

/// Pick a publisher for a registry URL.
///
/// `file://` needs no credential; HTTP(S) registries require the token.
pub fn publisher_for(
    registry: &str,
    token: Option<Secret>,
) -> Result<Box<dyn Publisher>, PublishError> {
    if let Some(path) = registry.strip_prefix("file://") {
        return Ok(Box::new(LocalRegistryPublisher::new(path)));
    }

    if registry.starts_with("https://") || registry.starts_with("http://") {
        let token = token.ok_or_else(|| {
            PublishError::Unauthorized("no registry token configured".to_string())
        })?;
        return Ok(Box::new(RegistryPublisher::new(registry, token)));
    }

    Err(PublishError::UnsupportedRegistry(registry.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ManifestEntry, PackageManifest};
    use chrono::Utc;
    use tempfile::TempDir;

    fn release() -> ReleaseCoordinates {
        ReleaseCoordinates::new("x86-windows", "1.2.3", "nightly").unwrap()
    }

    fn package(temp: &TempDir, signed: bool) -> Package {
        let path = temp.path().join("tool-1.2.3-x86-windows.tar.gz");
        std::fs::write(&path, b"archive bytes").unwrap();

        let mut manifest = PackageManifest::new("tool", &release());
        manifest.artifacts.push(ManifestEntry {
            name: "tool".to_string(),
            path: "bin/tool.exe".to_string(),
            sha256: "ab".repeat(32),
            signed,
            signature_path: None,
        });

        Package {
            path,
            sha256: "cd".repeat(32),
            size_bytes: 13,
            manifest,
            produced_by: "package".to_string(),
            created_at: Utc::now(),
        }
    }

    fn target(registry: &str) -> PublishTarget {
        PublishTarget {
            registry: registry.to_string(),
            release: release(),
        }
    }

    #[test]
    fn test_unsigned_package_is_refused() {
        let temp = TempDir::new().unwrap();
        let err = ensure_publishable(&package(&temp, false), &target("file:///x")).unwrap_err();
        assert!(matches!(err, PublishError::Unsigned(_)));
    }

    #[test]
    fn test_mismatched_coordinates_are_refused() {
        let temp = TempDir::new().unwrap();
        let mut t = target("file:///x");
        t.release.channel = "stable".to_string();
        let err = ensure_publishable(&package(&temp, true), &t).unwrap_err();
        assert!(matches!(err, PublishError::Mismatch(_)));
    }

    #[tokio::test]
    async fn test_escaping_coordinates_are_refused() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path().join("registry");
        let publisher = LocalRegistryPublisher::new(&registry);

        let mut t = target(&format!("file://{}", registry.display()));
        t.release.channel = "../../outside".to_string();
        let mut pkg = package(&temp, true);
        pkg.manifest.channel = t.release.channel.clone();

        let err = publisher.publish(&pkg, &t).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidCoordinate(_)));
        assert!(!temp.path().join("outside").exists());
    }

    #[test]
    fn test_status_mapping() {
        let temp = TempDir::new().unwrap();
        let pkg = package(&temp, true);
        let t = target("https://registry.example");

        assert!(check_status(201, "", &t, &pkg).is_ok());
        assert!(matches!(
            check_status(409, "", &t, &pkg),
            Err(PublishError::Conflict { .. })
        ));
        assert!(matches!(
            check_status(403, "", &t, &pkg),
            Err(PublishError::Unauthorized(_))
        ));

        let server_error = check_status(503, "busy", &t, &pkg).unwrap_err();
        assert!(server_error.is_transient());
        let client_error = check_status(400, "bad", &t, &pkg).unwrap_err();
        assert!(!client_error.is_transient());
    }

    #[test]
    fn test_upload_url() {
        let temp = TempDir::new().unwrap();
        let publisher = RegistryPublisher::new("https://registry.example/", Secret::new("t"));
        assert_eq!(
            publisher.upload_url(&package(&temp, true)),
            "https://registry.example/packages/tool/x86-windows/1.2.3"
        );
    }

    #[tokio::test]
    async fn test_local_registry_publish_and_conflict() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path().join("registry");
        let publisher = LocalRegistryPublisher::new(&registry);
        let pkg = package(&temp, true);
        let t = target(&format!("file://{}", registry.display()));

        let receipt = publisher.publish(&pkg, &t).await.unwrap();
        assert_eq!(receipt.version, "1.2.3");
        assert_eq!(receipt.channel, "nightly");
        assert!(registry
            .join("tool/nightly/x86-windows/1.2.3/tool-1.2.3-x86-windows.tar.gz")
            .is_file());

        let again = publisher.publish(&pkg, &t).await.unwrap_err();
        assert!(matches!(again, PublishError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_local_registry_refuses_unsigned() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path().join("registry");
        let publisher = LocalRegistryPublisher::new(&registry);

        let err = publisher
            .publish(
                &package(&temp, false),
                &target(&format!("file://{}", registry.display())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unsigned(_)));
        assert!(!registry.exists());
    }

    #[test]
    fn test_publisher_selection() {
        assert_eq!(publisher_for("file:///tmp/reg", None).unwrap().name(), "local");
        assert_eq!(
            publisher_for("https://r.example", Some(Secret::new("t")))
                .unwrap()
                .name(),
            "registry"
        );
        assert!(matches!(
            publisher_for("https://r.example", None),
            Err(PublishError::Unauthorized(_))
        ));
        assert!(matches!(
            publisher_for("ftp://r.example", None),
            Err(PublishError::UnsupportedRegistry(_))
        ));
    }

    #[tokio::test]
    async fn test_local_registry_refuses_other_registry() {
        let temp = TempDir::new().unwrap();
        let configured = temp.path().join("configured");
        let requested = temp.path().join("requested");
        let publisher = LocalRegistryPublisher::new(&configured);

        let err = publisher
            .publish(
                &package(&temp, true),
                &target(&format!("file://{}", requested.display())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::WrongRegistry { .. }));
        assert!(!configured.exists());
        assert!(!requested.exists());
    }

    #[tokio::test]
    async fn test_registry_publisher_refuses_other_registry() {
        let temp = TempDir::new().unwrap();
        let publisher = RegistryPublisher::new("https://a.example", Secret::new("t"));

        let err = publisher
            .upload(&package(&temp, true), &target("https://b.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::WrongRegistry { .. }));
    }

    #[tokio::test]
    async fn test_router_uses_target_registry() {
        let temp = TempDir::new().unwrap();
        let requested = temp.path().join("requested");
        let router = RegistryRouter::new(None);

        let receipt = router
            .publish(
                &package(&temp, true),
                &target(&format!("file://{}", requested.display())),
            )
            .await
            .unwrap();
        assert!(receipt.url.starts_with(&format!("file://{}", requested.display())));
        assert!(requested
            .join("tool/nightly/x86-windows/1.2.3/manifest.json")
            .is_file());
    }

    #[tokio::test]
    async fn test_failed_local_upload_leaves_no_entry() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path().join("registry");
        let publisher = LocalRegistryPublisher::new(&registry);
        let t = target(&format!("file://{}", registry.display()));

        let mut missing = package(&temp, true);
        missing.path = temp.path().join("gone.tar.gz");
        let err = publisher.publish(&missing, &t).await.unwrap_err();
        assert!(matches!(err, PublishError::Io(_)));
        assert!(!registry.join("tool/nightly/x86-windows/1.2.3").exists());

        // Staging directories are cleaned up too
        let leftovers: Vec<_> = std::fs::read_dir(&registry)
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty());

        // The version is still free
        publisher.publish(&package(&temp, true), &t).await.unwrap();
    }
}

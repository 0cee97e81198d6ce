//! Component interfaces for the external systems a release touches.
//!
//! Each pipeline step kind is served by one component: a toolchain
//! provisioner, a builder, a signer, a packager and a publisher. The
//! orchestrator only sees these traits, so tests can substitute fakes.

pub mod builder;
pub mod packager;
mod process;
pub mod publisher;
pub mod signer;
pub mod toolchain;

use async_trait::async_trait;

use crate::domain::{Artifact, Package};

pub use builder::{BuildError, BuildMode, BuildRequest, CargoBuilder};
pub use packager::{PackageRequest, PackagingError, TarballPackager};
pub use publisher::{
    ensure_publishable, publisher_for, LocalRegistryPublisher, PublishError, PublishReceipt,
    PublishTarget, RegistryPublisher, RegistryRouter,
};
pub use signer::{CommandSigner, KeySigner, SigningError};
pub use toolchain::{
    ProvisionError, ProvisionOutcome, RustupProvisioner, ToolchainChannel, ToolchainSpec,
};

/// Makes a toolchain and target available on the build host
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Human-readable component name
    fn name(&self) -> &str;

    /// Install what is missing. Must be idempotent.
    async fn provision(&self, spec: &ToolchainSpec) -> Result<ProvisionOutcome, ProvisionError>;
}

/// Compiles sources into an artifact
#[async_trait]
pub trait Builder: Send + Sync {
    fn name(&self) -> &str;

    async fn build(&self, request: &BuildRequest) -> Result<Artifact, BuildError>;
}

/// Signs artifacts with a credential held by the implementation
#[async_trait]
pub trait Signer: Send + Sync {
    fn name(&self) -> &str;

    /// Return the signed artifacts, in input order
    async fn sign(&self, artifacts: &[Artifact]) -> Result<Vec<Artifact>, SigningError>;
}

/// Bundles artifacts into a distributable package
#[async_trait]
pub trait Packager: Send + Sync {
    fn name(&self) -> &str;

    async fn package(&self, request: &PackageRequest) -> Result<Package, PackagingError>;
}

/// Uploads packages to a registry
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Transfer the package. Called only after the publish policy passed.
    async fn upload(
        &self,
        package: &Package,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, PublishError>;

    /// Publish a package.
    ///
    /// Refuses packages without a signed artifact and packages whose
    /// manifest disagrees with the target coordinates.
    async fn publish(
        &self,
        package: &Package,
        target: &PublishTarget,
    ) -> Result<PublishReceipt, PublishError> {
        ensure_publishable(package, target)?;
        self.upload(package, target).await
    }
}

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_client::Reference;
use oci_client::manifest::{ImageIndexEntry, OciDescriptor, OciImageIndex, OciManifest};
use oci_client::secrets::RegistryAuth;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Attempts per layer blob before giving up.
const MAX_BLOB_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("no image for platform {os}/{arch} (available: {available})")]
    NoPlatform {
        os: String,
        arch: String,
        available: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where container image layers come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Download the layers of `reference` into `dest`, returning the layer
    /// blob files in application order (lowest first).
    async fn pull(&self, reference: &str, dest: &Path) -> Result<Vec<PathBuf>, PullError>;
}

/// Pulls images anonymously from an OCI registry.
pub struct RegistrySource {
    client: oci_client::Client,
}

impl Default for RegistrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistrySource {
    pub fn new() -> Self {
        Self {
            client: oci_client::Client::new(Default::default()),
        }
    }

    async fn resolve_layers(&self, reference: &Reference) -> Result<Vec<OciDescriptor>, PullError> {
        let (manifest, digest) = self
            .client
            .pull_manifest(reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| PullError::Registry(format!("pull manifest: {e}")))?;
        info!(reference = %reference, digest = %digest, "manifest pulled");

        match manifest {
            OciManifest::Image(image) => Ok(image.layers),
            OciManifest::ImageIndex(index) => {
                let (os, arch) = host_platform();
                let entry = select_platform(&index, os, arch)?;
                let platform_ref: Reference = format!("{}@{}", reference.whole(), entry.digest)
                    .parse()
                    .map_err(|e| PullError::InvalidReference(format!("{e}")))?;
                let (platform_manifest, _) = self
                    .client
                    .pull_manifest(&platform_ref, &RegistryAuth::Anonymous)
                    .await
                    .map_err(|e| PullError::Registry(format!("pull platform manifest: {e}")))?;
                match platform_manifest {
                    OciManifest::Image(image) => Ok(image.layers),
                    OciManifest::ImageIndex(_) => Err(PullError::Registry(
                        "platform manifest is an index, not an image".into(),
                    )),
                }
            }
        }
    }

    async fn pull_layer(
        &self,
        reference: &Reference,
        layer: &OciDescriptor,
        path: &Path,
    ) -> Result<(), PullError> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_BLOB_ATTEMPTS {
            let mut file = tokio::fs::File::create(path).await?;
            match self.client.pull_blob(reference, layer, &mut file).await {
                Ok(_) => {
                    file.flush().await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(digest = %layer.digest, attempt, error = %e, "layer download failed");
                    last_error = e.to_string();
                }
            }
        }
        Err(PullError::Registry(format!(
            "layer {} failed after {MAX_BLOB_ATTEMPTS} attempts: {last_error}",
            layer.digest
        )))
    }
}

#[async_trait]
impl ImageSource for RegistrySource {
    async fn pull(&self, reference: &str, dest: &Path) -> Result<Vec<PathBuf>, PullError> {
        let parsed: Reference = reference
            .parse()
            .map_err(|e| PullError::InvalidReference(format!("{reference}: {e}")))?;
        let layers = self.resolve_layers(&parsed).await?;

        tokio::fs::create_dir_all(dest).await?;
        let mut paths = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let path = dest.join(format!("layer-{i}"));
            self.pull_layer(&parsed, layer, &path).await?;
            paths.push(path);
        }
        info!(reference, layers = paths.len(), "image layers pulled");
        Ok(paths)
    }
}

fn host_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "x86_64" => "amd64",
        "x86" => "386",
        other => other,
    };
    ("linux", arch)
}

fn select_platform<'a>(
    index: &'a OciImageIndex,
    os: &str,
    arch: &str,
) -> Result<&'a ImageIndexEntry, PullError> {
    index
        .manifests
        .iter()
        .find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == arch)
        })
        .ok_or_else(|| PullError::NoPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
            available: index
                .manifests
                .iter()
                .filter_map(|m| {
                    m.platform
                        .as_ref()
                        .map(|p| format!("{}/{}", p.os, p.architecture))
                })
                .collect::<Vec<_>>()
                .join(", "),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_platform_is_linux() {
        let (os, arch) = host_platform();
        assert_eq!(os, "linux");
        assert!(!arch.is_empty());
    }

    #[tokio::test]
    async fn invalid_reference_is_rejected_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let err = RegistrySource::new()
            .pull("Not A Valid Reference", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PullError::InvalidReference(_)), "got {err:?}");
    }
}

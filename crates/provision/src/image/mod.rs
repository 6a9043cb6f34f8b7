//! Squashfs root filesystem builds.
//!
//! Two flavours: the canonical rootfs, rebuilt from an ext4 base image, and
//! per-reference images built from container registry layers and cached
//! under `blobs/`. Both publish through a temp file and an atomic rename, so
//! a visible artifact is always complete.

mod source;
mod unpack;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use oci_client::Reference;
use tracing::{info, warn};

pub use source::{ImageSource, PullError, RegistrySource};
pub use unpack::unpack_layers;

use crate::command::{CommandError, CommandRunner, HostCommand};
use crate::mount::{MountError, MountService};
use crate::overlay::{ComposeError, OverlayComposer, verify_layout};
use crate::paths::{CachePaths, blob_key};

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Mount(#[from] MountError),

    #[error("failed to pull {reference}: {source}")]
    Pull {
        reference: String,
        #[source]
        source: PullError,
    },

    #[error("failed to extract {reference}: {source}")]
    Extract {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Compose(#[from] ComposeError),

    #[error("squashfs packing failed: {0}")]
    Pack(#[source] CommandError),

    #[error("filesystem format failed: {0}")]
    Format(#[source] CommandError),

    #[error("invalid image reference: {0:?}")]
    InvalidReference(String),
}

/// Validate `reference` and derive its file name under `blobs/`.
fn cache_key(reference: &str) -> Result<String, ImageError> {
    let invalid = || ImageError::InvalidReference(reference.to_string());
    if reference.trim() != reference {
        return Err(invalid());
    }
    reference.parse::<Reference>().map_err(|_| invalid())?;
    blob_key(reference).ok_or_else(invalid)
}

impl ImageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn task(path: &Path, e: tokio::task::JoinError) -> Self {
        Self::io(path, std::io::Error::other(e))
    }
}

#[derive(Clone)]
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    mounts: MountService,
    composer: OverlayComposer,
    cache: CachePaths,
    source: Arc<dyn ImageSource>,
}

impl ImageBuilder {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        composer: OverlayComposer,
        cache: CachePaths,
        source: Arc<dyn ImageSource>,
    ) -> Self {
        let mounts = MountService::new(Arc::clone(&runner), cache.scratch());
        Self {
            runner,
            mounts,
            composer,
            cache,
            source,
        }
    }

    pub fn mounts(&self) -> &MountService {
        &self.mounts
    }

    pub fn cache(&self) -> &CachePaths {
        &self.cache
    }

    /// Build the canonical rootfs at `output` from an ext4 `base_image`.
    ///
    /// Always rebuilds. Blocking; async callers run it on the blocking pool.
    pub fn build_from_base_image(
        &self,
        base_image: &Path,
        init_script: &Path,
        output: &Path,
    ) -> Result<(), ImageError> {
        info!(base = %base_image.display(), output = %output.display(), "building rootfs");
        let mount = self.mounts.mount(base_image)?;
        self.composer
            .add_overlay_support(mount.path(), init_script)?;

        let tmp = temp_sibling(output);
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
        }
        if let Err(e) = self.squash(mount.path(), &tmp) {
            remove_temp(&tmp);
            return Err(e);
        }
        if let Err(e) = mount.release() {
            remove_temp(&tmp);
            return Err(e.into());
        }
        publish(&tmp, output)?;
        info!(output = %output.display(), "rootfs built");
        Ok(())
    }

    /// Build (or fetch from cache) the squashfs image for a container
    /// `reference`, returning its path under `blobs/`.
    pub async fn build_from_container_image(
        &self,
        reference: &str,
        init_script: &Path,
    ) -> Result<PathBuf, ImageError> {
        let output = self.cache.blob(&cache_key(reference)?);
        if tokio::fs::try_exists(&output)
            .await
            .map_err(|e| ImageError::io(&output, e))?
        {
            info!(reference, path = %output.display(), "image cache hit");
            return Ok(output);
        }

        let scratch_root = self.cache.scratch();
        tokio::fs::create_dir_all(&scratch_root)
            .await
            .map_err(|e| ImageError::io(&scratch_root, e))?;
        let scratch = tempfile::Builder::new()
            .prefix("build-")
            .tempdir_in(&scratch_root)
            .map_err(|e| ImageError::io(&scratch_root, e))?;

        info!(reference, "pulling image");
        let layers = self
            .source
            .pull(reference, &scratch.path().join("layers"))
            .await
            .map_err(|source| ImageError::Pull {
                reference: reference.to_string(),
                source,
            })?;

        let builder = self.clone();
        let reference_owned = reference.to_string();
        let init_script = init_script.to_path_buf();
        let rootfs = scratch.path().join("rootfs");
        let published = output.clone();
        tokio::task::spawn_blocking(move || {
            builder.pack_layers(&reference_owned, &layers, &rootfs, &init_script, &published)
        })
        .await
        .map_err(|e| ImageError::task(&output, e))??;

        // `scratch` drops here, taking layers and the unpacked tree with it.
        info!(reference, path = %output.display(), "image built");
        Ok(output)
    }

    fn pack_layers(
        &self,
        reference: &str,
        layers: &[PathBuf],
        rootfs: &Path,
        init_script: &Path,
        output: &Path,
    ) -> Result<(), ImageError> {
        unpack_layers(layers, rootfs).map_err(|source| ImageError::Extract {
            reference: reference.to_string(),
            source,
        })?;
        self.composer.add_overlay_support(rootfs, init_script)?;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
        }
        let tmp = temp_sibling(output);
        if let Err(e) = self.squash(rootfs, &tmp) {
            remove_temp(&tmp);
            return Err(e);
        }
        publish(&tmp, output)
    }

    fn squash(&self, source: &Path, output: &Path) -> Result<(), ImageError> {
        verify_layout(source)?;
        let command = HostCommand::new("mksquashfs")
            .arg(source)
            .arg(output)
            .arg("-noappend");
        self.runner.run(&command).map_err(ImageError::Pack)?;
        Ok(())
    }
}

/// Unique hidden temp path next to `path`, on the same filesystem.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()))
}

fn publish(tmp: &Path, output: &Path) -> Result<(), ImageError> {
    std::fs::rename(tmp, output).map_err(|e| {
        remove_temp(tmp);
        ImageError::io(output, e)
    })
}

fn remove_temp(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeSource};

    struct Fixture {
        dir: tempfile::TempDir,
        host: Arc<FakeHost>,
        source: Arc<FakeSource>,
        builder: ImageBuilder,
        init: PathBuf,
    }

    fn fixture(source: FakeSource) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let source = Arc::new(source);
        let cache = CachePaths::new(dir.path().join("cache"));
        cache.create_all().unwrap();
        let builder = ImageBuilder::new(
            host.clone(),
            OverlayComposer::default(),
            cache,
            source.clone(),
        );
        let init = dir.path().join("overlay-init.sh");
        std::fs::write(&init, b"#!/bin/sh\n").unwrap();
        Fixture {
            dir,
            host,
            source,
            builder,
            init,
        }
    }

    fn alpine() -> FakeSource {
        FakeSource::new().with_image(
            "alpine:3.19",
            vec![
                FakeSource::tar_layer(&[("etc/", ""), ("etc/os-release", "alpine")]),
                FakeSource::tar_layer(&[("etc/hostname", "vm")]),
            ],
        )
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".tmp-"))
            .collect()
    }

    #[test]
    fn base_image_build_publishes_squashfs_with_overlay_layout() {
        let f = fixture(FakeSource::new());
        let base = f.dir.path().join("base.ext4");
        f.host.make_image(&base, |root| {
            std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        });
        let output = f.dir.path().join("out/rootfs.squashfs");

        f.builder
            .build_from_base_image(&base, &f.init, &output)
            .unwrap();

        let manifest = std::fs::read_to_string(&output).unwrap();
        assert!(manifest.contains("d 0755 overlay/work"));
        assert!(manifest.contains("d 0755 overlay/root"));
        assert!(manifest.contains("d 0755 mnt"));
        assert!(manifest.contains("d 0755 rom"));
        assert!(manifest.contains("f 0755 sbin/overlay-init"));
        assert!(manifest.contains("etc/resolv.conf"));
        assert!(manifest.contains("d 0755 usr/bin"));
        assert!(leftovers(output.parent().unwrap()).is_empty());
        assert_eq!(f.host.count("umount"), 1);
    }

    #[test]
    fn base_image_build_always_rebuilds() {
        let f = fixture(FakeSource::new());
        let base = f.dir.path().join("base.ext4");
        f.host.make_image(&base, |_| {});
        let output = f.dir.path().join("rootfs");
        std::fs::write(&output, b"stale").unwrap();

        f.builder
            .build_from_base_image(&base, &f.init, &output)
            .unwrap();
        assert_ne!(std::fs::read(&output).unwrap(), b"stale");
    }

    #[test]
    fn pack_failure_leaves_no_artifact_and_unmounts() {
        let f = fixture(FakeSource::new());
        let base = f.dir.path().join("base.ext4");
        f.host.make_image(&base, |_| {});
        f.host.fail_program("mksquashfs");
        let output = f.dir.path().join("rootfs");

        let err = f
            .builder
            .build_from_base_image(&base, &f.init, &output)
            .unwrap_err();
        assert!(matches!(err, ImageError::Pack(_)));
        assert!(!output.exists());
        assert!(leftovers(f.dir.path()).is_empty());
        assert_eq!(f.host.count("umount"), 1);
    }

    #[test]
    fn compose_failure_releases_mount() {
        let f = fixture(FakeSource::new());
        let base = f.dir.path().join("base.ext4");
        f.host.make_image(&base, |_| {});

        let err = f
            .builder
            .build_from_base_image(
                &base,
                &f.dir.path().join("missing.sh"),
                &f.dir.path().join("rootfs"),
            )
            .unwrap_err();
        assert!(matches!(err, ImageError::Compose(ComposeError::Read { .. })));
        assert_eq!(f.host.count("umount"), 1);
        assert_eq!(f.host.count("mksquashfs"), 0);
    }

    #[test]
    fn mount_failure_is_reported() {
        let f = fixture(FakeSource::new());
        let err = f
            .builder
            .build_from_base_image(
                &f.dir.path().join("missing.ext4"),
                &f.init,
                &f.dir.path().join("rootfs"),
            )
            .unwrap_err();
        assert!(matches!(err, ImageError::Mount(MountError::Io { .. })));
    }

    #[tokio::test]
    async fn container_build_is_cached() {
        let f = fixture(alpine());

        let first = f
            .builder
            .build_from_container_image("alpine:3.19", &f.init)
            .await
            .unwrap();
        assert_eq!(first, f.builder.cache().blob("alpine-3.19"));
        let manifest = std::fs::read_to_string(&first).unwrap();
        assert!(manifest.contains("f 0644 etc/os-release 6"));
        assert!(manifest.contains("f 0644 etc/hostname 2"));
        assert!(manifest.contains("f 0755 sbin/overlay-init"));

        let second = f
            .builder
            .build_from_container_image("alpine:3.19", &f.init)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(f.source.pulls(), 1);
        assert_eq!(f.host.count("mksquashfs"), 1);
    }

    #[tokio::test]
    async fn container_build_removes_scratch() {
        let f = fixture(alpine());
        f.builder
            .build_from_container_image("alpine:3.19", &f.init)
            .await
            .unwrap();
        let scratch = std::fs::read_dir(f.builder.cache().scratch()).unwrap().count();
        assert_eq!(scratch, 0);
    }

    #[tokio::test]
    async fn concurrent_first_builds_produce_one_complete_artifact() {
        let f = fixture(alpine());
        let (a, b) = tokio::join!(
            f.builder.build_from_container_image("alpine:3.19", &f.init),
            f.builder.build_from_container_image("alpine:3.19", &f.init),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        let manifest = std::fs::read_to_string(&a).unwrap();
        assert!(manifest.contains("sbin/overlay-init"));
        assert!(leftovers(&f.builder.cache().blobs()).is_empty());
    }

    #[tokio::test]
    async fn pull_failure_is_reported_with_reference() {
        let f = fixture(FakeSource::new());
        let err = f
            .builder
            .build_from_container_image("missing:latest", &f.init)
            .await
            .unwrap_err();
        let ImageError::Pull { reference, .. } = err else {
            panic!("expected Pull, got {err:?}");
        };
        assert_eq!(reference, "missing:latest");
        assert!(!f.builder.cache().blob("missing-latest").exists());
    }

    #[tokio::test]
    async fn extract_failure_is_reported() {
        let f = fixture(FakeSource::new().with_image("bad:1", vec![vec![0x1f, 0x8b, 0, 0]]));
        let err = f
            .builder
            .build_from_container_image("bad:1", &f.init)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Extract { .. }), "got {err:?}");
        assert!(!f.builder.cache().blob("bad-1").exists());
    }

    #[tokio::test]
    async fn pack_failure_leaves_no_blob() {
        let f = fixture(alpine());
        f.host.fail_program("mksquashfs");
        let err = f
            .builder
            .build_from_container_image("alpine:3.19", &f.init)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Pack(_)));
        assert!(!f.builder.cache().blob("alpine-3.19").exists());
        assert!(leftovers(&f.builder.cache().blobs()).is_empty());
    }

    #[tokio::test]
    async fn empty_reference_is_rejected() {
        let f = fixture(FakeSource::new());
        let err = f
            .builder
            .build_from_container_image("  ", &f.init)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::InvalidReference(_)));
        assert_eq!(f.source.pulls(), 0);
    }

    #[tokio::test]
    async fn directory_like_references_are_rejected() {
        let f = fixture(FakeSource::new());
        std::fs::create_dir_all(f.builder.cache().blobs()).unwrap();
        for reference in [".", "..", "../etc", "alpine 3", "Alpine:3.19", "/abs"] {
            let err = f
                .builder
                .build_from_container_image(reference, &f.init)
                .await
                .unwrap_err();
            assert!(matches!(err, ImageError::InvalidReference(_)), "{reference}: {err:?}");
        }
        assert_eq!(f.source.pulls(), 0);
    }

    #[test]
    fn cache_key_accepts_registry_references() {
        assert_eq!(cache_key("alpine:3.19").unwrap(), "alpine-3.19");
        assert_eq!(
            cache_key("ghcr.io/org/app:v1").unwrap(),
            "ghcr.io-org-app-v1"
        );
    }

    #[test]
    fn temp_sibling_is_hidden_and_unique() {
        let a = temp_sibling(Path::new("/cache/blobs/alpine-3"));
        let b = temp_sibling(Path::new("/cache/blobs/alpine-3"));
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(Path::new("/cache/blobs")));
        assert!(a.file_name().unwrap().to_string_lossy().starts_with(".alpine-3.tmp-"));
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use provision::{ImageBuilder, RegistrySource, SystemRunner};
use tracing::info;

use crate::config::{self, ControllerConfig, RootfsSection};
use crate::error::{ControllerError, ControllerResult};

#[derive(Args)]
pub struct RootfsArgs {
    /// Controller config file (YAML).
    #[arg(long)]
    config: PathBuf,
    /// Rebuild even if the rootfs already exists.
    #[arg(long)]
    force: bool,
}

pub async fn run_rootfs(args: RootfsArgs) -> ControllerResult<()> {
    let config = config::load(&args.config).await?;
    let images = image_builder(&config)?;
    build_rootfs(&images, &config.rootfs, args.force).await?;
    Ok(())
}

/// Image builder on the real host, with cache directories created.
pub(crate) fn image_builder(config: &ControllerConfig) -> ControllerResult<ImageBuilder> {
    let cache = config.cache_paths();
    cache.create_all()?;
    Ok(ImageBuilder::new(
        Arc::new(SystemRunner),
        config.overlay_composer(),
        cache,
        Arc::new(RegistrySource::new()),
    ))
}

/// Build the canonical rootfs unless it exists. Returns whether it was built.
pub(crate) async fn build_rootfs(
    images: &ImageBuilder,
    rootfs: &RootfsSection,
    force: bool,
) -> ControllerResult<bool> {
    if !force
        && tokio::fs::try_exists(&rootfs.output)
            .await
            .unwrap_or(false)
    {
        info!(output = %rootfs.output.display(), "[OK] rootfs already built");
        return Ok(false);
    }

    let images = images.clone();
    let base = rootfs.base_image.clone();
    let init = rootfs.init_script.clone();
    let output = rootfs.output.clone();
    tokio::task::spawn_blocking(move || images.build_from_base_image(&base, &init, &output))
        .await
        .map_err(|e| ControllerError::Internal(format!("rootfs task: {e}")))??;
    info!(output = %rootfs.output.display(), "[OK] rootfs built");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use provision::testing::{FakeHost, FakeSource};
    use provision::{CachePaths, OverlayComposer};

    use super::*;

    fn section(dir: &std::path::Path) -> RootfsSection {
        RootfsSection {
            base_image: dir.join("base.ext4"),
            init_script: dir.join("overlay-init"),
            output: dir.join("out/rootfs.squashfs"),
        }
    }

    fn fake_images(host: &Arc<FakeHost>, dir: &std::path::Path) -> ImageBuilder {
        ImageBuilder::new(
            host.clone(),
            OverlayComposer::default(),
            CachePaths::new(dir.join("cache")),
            Arc::new(FakeSource::new()),
        )
    }

    #[tokio::test]
    async fn builds_missing_rootfs_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let rootfs = section(dir.path());
        std::fs::write(&rootfs.init_script, "#!/bin/sh\n").unwrap();
        std::fs::write(&rootfs.base_image, vec![0u8; 4096]).unwrap();
        host.make_image(&rootfs.base_image, |root| {
            std::fs::create_dir_all(root.join("etc")).unwrap();
        });
        let images = fake_images(&host, dir.path());

        assert!(build_rootfs(&images, &rootfs, false).await.unwrap());
        assert!(rootfs.output.exists());
        assert!(!build_rootfs(&images, &rootfs, false).await.unwrap());
        assert_eq!(host.count("mksquashfs"), 1);

        assert!(build_rootfs(&images, &rootfs, true).await.unwrap());
        assert_eq!(host.count("mksquashfs"), 2);
    }

    #[tokio::test]
    async fn mount_failure_is_an_image_error() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(FakeHost::new());
        let rootfs = section(dir.path());
        std::fs::write(&rootfs.base_image, b"not a filesystem").unwrap();
        std::fs::write(&rootfs.init_script, "#!/bin/sh\n").unwrap();

        let err = build_rootfs(&fake_images(&host, dir.path()), &rootfs, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::Image(_)));
        assert!(!rootfs.output.exists());
    }
}

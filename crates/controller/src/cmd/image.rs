use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::cmd::rootfs::image_builder;
use crate::config;
use crate::error::ControllerResult;

#[derive(Args)]
pub struct ImageArgs {
    /// Controller config file (YAML).
    #[arg(long)]
    config: PathBuf,
    /// Container image reference, e.g. `docker.io/library/alpine:3.19`.
    reference: String,
}

/// Build (or reuse) the squashfs image for a container reference and print
/// its path.
pub async fn run_image(args: ImageArgs) -> ControllerResult<()> {
    let config = config::load(&args.config).await?;
    let images = image_builder(&config)?;
    let path = images
        .build_from_container_image(&args.reference, &config.rootfs.init_script)
        .await?;
    info!(reference = %args.reference, path = %path.display(), "[OK] image ready");
    println!("{}", path.display());
    Ok(())
}

mod image;
pub(crate) mod rootfs;
mod serve;

pub use image::{ImageArgs, run_image};
pub use rootfs::{RootfsArgs, run_rootfs};
pub use serve::{ServeArgs, run_serve};

use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::command::{CommandRunner, HostCommand};
use crate::image::ImageError;
use crate::mount::MountService;
use crate::paths::CachePaths;

/// Size of every SSH key disk.
pub const SSH_DISK_SIZE: u64 = 2 * 1024 * 1024;

/// Hex SHA-256 of the raw key bytes.
pub fn key_digest(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    format!("{:x}", hasher.finalize())
}

/// Builds small ext4 disks carrying `root/.ssh/authorized_keys`, one per
/// distinct public key.
#[derive(Clone)]
pub struct SshKeyImageBuilder {
    runner: Arc<dyn CommandRunner>,
    mounts: MountService,
    cache: CachePaths,
}

impl SshKeyImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, cache: CachePaths) -> Self {
        let mounts = MountService::new(Arc::clone(&runner), cache.scratch());
        Self {
            runner,
            mounts,
            cache,
        }
    }

    /// Return the disk for `public_key`, building it on first use.
    ///
    /// Blocking; async callers run it on the blocking pool.
    pub fn build(&self, public_key: &[u8]) -> Result<PathBuf, ImageError> {
        let digest = key_digest(public_key);
        let output = self.cache.ssh_key(&digest);
        if output.exists() {
            return Ok(output);
        }

        let dir = self.cache.ssh_keys();
        std::fs::create_dir_all(&dir).map_err(|e| ImageError::io(&dir, e))?;
        // Removed on drop unless persisted.
        let disk = tempfile::Builder::new()
            .prefix(".key-")
            .suffix(".img")
            .tempfile_in(&dir)
            .map_err(|e| ImageError::io(&dir, e))?;
        disk.as_file()
            .set_len(SSH_DISK_SIZE)
            .map_err(|e| ImageError::io(disk.path(), e))?;

        self.runner
            .run(
                &HostCommand::new("mkfs.ext4")
                    .args(["-F", "-q"])
                    .arg(disk.path()),
            )
            .map_err(ImageError::Format)?;

        let mount = self.mounts.mount(disk.path())?;
        write_authorized_keys(mount.path(), public_key)?;
        mount.release()?;

        disk.persist(&output)
            .map_err(|e| ImageError::io(&output, e.error))?;
        info!(digest = %digest, path = %output.display(), "ssh key disk built");
        Ok(output)
    }
}

fn write_authorized_keys(root: &Path, public_key: &[u8]) -> Result<(), ImageError> {
    let ssh_dir = root.join("root/.ssh");
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&ssh_dir)
        .and_then(|()| std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700)))
        .map_err(|e| ImageError::io(&ssh_dir, e))?;

    let keys = ssh_dir.join("authorized_keys");
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&keys)
        .map_err(|e| ImageError::io(&keys, e))?;
    file.write_all(public_key)
        .map_err(|e| ImageError::io(&keys, e))?;
    Ok(())
}

//! Loop-mounting ext4 image files into private scratch directories.
//!
//! A [`MountHandle`] owns the mount: while it lives, the image file is held
//! under an exclusive `flock` so two builders never mount the same file at
//! once. Releasing (explicitly or on drop) unmounts, unlocks and removes the
//! mount point, in that order, exactly once.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

use crate::command::{CommandError, CommandRunner, HostCommand};

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mount failed: {0}")]
    Mount(#[source] CommandError),

    #[error("unmount failed: {0}")]
    Unmount(#[source] CommandError),
}

impl MountError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Clone)]
pub struct MountService {
    runner: Arc<dyn CommandRunner>,
    scratch_dir: PathBuf,
}

impl MountService {
    pub fn new(runner: Arc<dyn CommandRunner>, scratch_dir: PathBuf) -> Self {
        Self {
            runner,
            scratch_dir,
        }
    }

    /// Mount `image` (an ext4 filesystem image) at a fresh directory.
    ///
    /// Blocks while another handle holds the same image.
    pub fn mount(&self, image: &Path) -> Result<MountHandle, MountError> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(image)
            .map_err(|e| MountError::io(image, e))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| MountError::io(image, errno.into()))?;

        std::fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| MountError::io(&self.scratch_dir, e))?;
        let dir = self
            .scratch_dir
            .join(format!("mnt-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir(&dir).map_err(|e| MountError::io(&dir, e))?;

        let command = HostCommand::new("mount")
            .args(["-o", "loop", "-t", "ext4"])
            .arg(image)
            .arg(&dir);
        if let Err(e) = self.runner.run(&command) {
            remove_mount_point(&dir);
            return Err(MountError::Mount(e));
        }

        debug!(image = %image.display(), path = %dir.display(), "mounted");
        Ok(MountHandle {
            runner: Arc::clone(&self.runner),
            path: dir,
            lock: Some(lock),
            released: false,
        })
    }
}

#[must_use]
pub struct MountHandle {
    runner: Arc<dyn CommandRunner>,
    path: PathBuf,
    lock: Option<Flock<File>>,
    released: bool,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("path", &self.path)
            .field("locked", &self.lock.is_some())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl MountHandle {
    /// Root of the mounted filesystem.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmount and clean up, reporting failures.
    pub fn release(mut self) -> Result<(), MountError> {
        self.release_once()
    }

    fn release_once(&mut self) -> Result<(), MountError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let unmounted = self
            .runner
            .run(&HostCommand::new("umount").arg(&self.path));
        drop(self.lock.take());

        // A directory that is still a mount point keeps the image content
        // reachable, so it is left in place.
        unmounted.map_err(MountError::Unmount)?;
        match std::fs::remove_dir(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(MountError::io(&self.path, e)),
        }
        debug!(path = %self.path.display(), "unmounted");
        Ok(())
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_once() {
            warn!(path = %self.path.display(), error = %e, "failed to release mount");
        }
    }
}

fn remove_mount_point(dir: &Path) {
    if let Err(e) = std::fs::remove_dir(dir) {
        warn!(path = %dir.display(), error = %e, "failed to remove mount point");
    }
}

use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{ControllerError, ControllerResult};

/// Take the host-wide controller lock without waiting.
///
/// Fails with [`ControllerError::AlreadyRunning`] if another process holds
/// it. The returned guard holds the lock until dropped.
pub async fn try_acquire(path: PathBuf) -> ControllerResult<Flock<std::fs::File>> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ControllerError::Internal(format!("open lock {}: {e}", path.display())))?;
        Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_file, e)| {
            if e == Errno::EWOULDBLOCK {
                ControllerError::AlreadyRunning(path.clone())
            } else {
                ControllerError::Internal(format!("flock {}: {e}", path.display()))
            }
        })
    })
    .await
    .map_err(|e| ControllerError::Internal(format!("lock task: {e}")))?
}

use std::path::{Path, PathBuf};

/// Default directory for Firecracker API sockets and config files.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/firecracker";

/// Cache key for a container image reference: `:` and `/` become `-`.
///
/// `None` when the key would not name a plain file inside `blobs/`.
pub fn blob_key(reference: &str) -> Option<String> {
    let key = reference.replace([':', '/'], "-");
    let plain = !key.is_empty()
        && !key.starts_with('.')
        && !key.contains(['/', '\\', '\0'])
        && key.len() <= 255;
    plain.then_some(key)
}

/// Build artifacts under the cache directory.
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Squashfs images built from container references.
    pub fn blobs(&self) -> PathBuf {
        self.root.join("blobs")
    }

    pub fn blob(&self, key: &str) -> PathBuf {
        self.blobs().join(key)
    }

    pub fn ssh_keys(&self) -> PathBuf {
        self.root.join("ssh_keys")
    }

    pub fn ssh_key(&self, digest: &str) -> PathBuf {
        self.ssh_keys().join(format!("{digest}.img"))
    }

    /// Mount points and private build directories.
    pub fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    /// Create every cache subdirectory.
    pub fn create_all(&self) -> std::io::Result<()> {
        for dir in [self.blobs(), self.ssh_keys(), self.scratch()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Per-VM runtime files under the socket directory.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    socket_dir: PathBuf,
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::new(PathBuf::from(DEFAULT_SOCKET_DIR))
    }
}

impl RuntimePaths {
    pub fn new(socket_dir: PathBuf) -> Self {
        Self { socket_dir }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// API socket: `<socket_dir>/<id>.sock`.
    pub fn socket(&self, id: &str) -> PathBuf {
        self.socket_dir.join(format!("{id}.sock"))
    }

    /// Firecracker config file: `<socket_dir>/<id>.json`.
    pub fn config(&self, id: &str) -> PathBuf {
        self.socket_dir.join(format!("{id}.json"))
    }

    /// Remove everything in the socket directory and recreate it empty.
    pub fn reset(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.socket_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::create_dir_all(&self.socket_dir)
    }
}

/// Per-VM console logs.
#[derive(Debug, Clone)]
pub struct LogPaths {
    log_dir: PathBuf,
}

impl LogPaths {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn stdout(&self, id: &str) -> PathBuf {
        self.log_dir.join(format!("{id}-out.log"))
    }

    pub fn stderr(&self, id: &str) -> PathBuf {
        self.log_dir.join(format!("{id}-err.log"))
    }
}

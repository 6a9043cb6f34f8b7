use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    /// Firecracker binary. A bare name is looked up on `PATH`.
    pub binary_path: PathBuf,
    /// How long to wait for the API socket to appear after spawn.
    pub api_ready_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL on stop.
    pub shutdown_timeout: Duration,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("firecracker"),
            api_ready_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

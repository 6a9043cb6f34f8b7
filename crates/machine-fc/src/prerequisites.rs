use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use machine::MachineError;

use crate::config::FirecrackerConfig;

/// Verify that the host can run Firecracker before any VM is started.
///
/// Checks the firecracker binary and `/dev/kvm`. Collects all failures and
/// returns them in a single `BackendNotAvailable` error.
pub fn check_prerequisites(config: &FirecrackerConfig) -> Result<(), MachineError> {
    let mut errors = Vec::new();

    match resolve_binary(&config.binary_path) {
        Some(binary) => check_executable(&binary, "firecracker binary", &mut errors),
        None => errors.push(format!(
            "firecracker binary not found: {}",
            config.binary_path.display()
        )),
    }
    check_kvm(&mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(MachineError::BackendNotAvailable(errors.join("; ")))
    }
}

/// Resolve `binary` to an existing file. Bare names go through `PATH`.
pub fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() == 1 && !binary.is_absolute() {
        return which::which(binary).ok();
    }
    binary.exists().then(|| binary.to_path_buf())
}

fn check_executable(path: &Path, label: &str, errors: &mut Vec<String>) {
    if let Ok(meta) = path.metadata()
        && meta.permissions().mode() & 0o111 == 0
    {
        errors.push(format!("{label} is not executable: {}", path.display()));
    }
}

fn check_kvm(errors: &mut Vec<String>) {
    let kvm = Path::new("/dev/kvm");
    if !kvm.exists() {
        errors.push("/dev/kvm not found (KVM not available)".to_string());
    } else if let Err(e) = std::fs::File::options().read(true).write(true).open(kvm) {
        errors.push(format!("/dev/kvm not accessible: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_is_reported() {
        let config = FirecrackerConfig {
            binary_path: PathBuf::from("/nonexistent/firecracker"),
            ..Default::default()
        };
        let err = check_prerequisites(&config).unwrap_err();
        let MachineError::BackendNotAvailable(msg) = err else {
            panic!("expected BackendNotAvailable, got {err:?}");
        };
        assert!(msg.contains("firecracker binary not found: /nonexistent/firecracker"));
    }

    #[test]
    fn non_executable_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("firecracker");
        std::fs::write(&binary, b"").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut errors = Vec::new();
        check_executable(&binary, "firecracker binary", &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("is not executable"));
    }

    #[test]
    fn resolve_binary_accepts_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("firecracker");
        std::fs::write(&binary, b"").unwrap();
        assert_eq!(resolve_binary(&binary), Some(binary));
    }

    #[test]
    fn resolve_binary_searches_path_for_bare_names() {
        assert!(resolve_binary(Path::new("sh")).is_some());
        assert!(resolve_binary(Path::new("definitely-not-a-real-binary-name")).is_none());
    }
}

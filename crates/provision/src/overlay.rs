use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Guest init that pivots into the overlay root.
pub const OVERLAY_INIT: &str = "sbin/overlay-init";

/// Directories the overlay init expects: upper/work dirs, new root, old root.
pub const OVERLAY_DIRS: [&str; 4] = ["overlay/work", "overlay/root", "mnt", "rom"];

const RESOLV_CONF: &str = "etc/resolv.conf";

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("incomplete overlay layout: missing {0}")]
    Incomplete(String),
}

/// Prepares a root filesystem tree for booting through the overlay init.
#[derive(Debug, Clone)]
pub struct OverlayComposer {
    nameservers: Vec<Ipv4Addr>,
}

impl Default for OverlayComposer {
    fn default() -> Self {
        Self::new(vec![Ipv4Addr::new(8, 8, 8, 8)])
    }
}

impl OverlayComposer {
    pub fn new(nameservers: Vec<Ipv4Addr>) -> Self {
        Self { nameservers }
    }

    /// Lay out the overlay directories, install `init_script` as the overlay
    /// init and write `etc/resolv.conf` under `root`.
    pub fn add_overlay_support(&self, root: &Path, init_script: &Path) -> Result<(), ComposeError> {
        for dir in OVERLAY_DIRS {
            create_dir_0755(&beneath(root, dir)?)?;
        }

        let script = std::fs::read(init_script).map_err(|source| ComposeError::Read {
            path: init_script.to_path_buf(),
            source,
        })?;
        place_file(root, OVERLAY_INIT, &script, Some(0o755))?;

        // Container images often ship resolv.conf as a dangling symlink.
        place_file(root, RESOLV_CONF, self.resolv_conf().as_bytes(), None)?;

        debug!(root = %root.display(), "overlay support added");
        Ok(())
    }

    fn resolv_conf(&self) -> String {
        self.nameservers
            .iter()
            .map(|ns| format!("nameserver {ns}\n"))
            .collect()
    }
}

/// Check that `root` carries the full overlay layout and an executable init.
pub fn verify_layout(root: &Path) -> Result<(), ComposeError> {
    for dir in OVERLAY_DIRS {
        if !beneath(root, dir)?.is_dir() {
            return Err(ComposeError::Incomplete(dir.to_string()));
        }
    }
    let executable = std::fs::metadata(beneath(root, OVERLAY_INIT)?)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        return Err(ComposeError::Incomplete(OVERLAY_INIT.to_string()));
    }
    Ok(())
}

/// Resolve `rel` against `root` as if `root` were `/`.
///
/// Symlinks are followed with absolute targets re-anchored at `root` and
/// `..` clamped at `root`, so the result never names a host path outside the
/// tree. Missing components are kept as plain names.
fn resolve_beneath(root: &Path, rel: &Path) -> std::io::Result<PathBuf> {
    let mut pending = Vec::new();
    push_components(&mut pending, rel);

    let mut resolved = PathBuf::new();
    let mut follows = 0usize;
    while let Some(step) = pending.pop() {
        let name = match step {
            Step::Up => {
                resolved.pop();
                continue;
            }
            Step::Name(name) => name,
        };
        let candidate = resolved.join(&name);
        let host = root.join(&candidate);
        let is_link = match std::fs::symlink_metadata(&host) {
            Ok(meta) => meta.file_type().is_symlink(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        if !is_link {
            resolved = candidate;
            continue;
        }

        follows += 1;
        if follows > MAX_SYMLINK_FOLLOWS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("too many levels of symbolic links: {}", rel.display()),
            ));
        }
        let target = std::fs::read_link(&host)?;
        if target.has_root() {
            resolved = PathBuf::new();
        }
        push_components(&mut pending, &target);
    }
    Ok(root.join(resolved))
}

const MAX_SYMLINK_FOLLOWS: usize = 40;

enum Step {
    Up,
    Name(OsString),
}

/// Push `path` onto the stack so its first component is popped next.
fn push_components(stack: &mut Vec<Step>, path: &Path) {
    let steps: Vec<Step> = path
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(Step::Name(name.to_os_string())),
            Component::ParentDir => Some(Step::Up),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
        })
        .collect();
    stack.extend(steps.into_iter().rev());
}

fn beneath(root: &Path, rel: &str) -> Result<PathBuf, ComposeError> {
    resolve_beneath(root, Path::new(rel)).map_err(|source| ComposeError::Read {
        path: root.join(rel),
        source,
    })
}

/// Write `rel` inside `root`, replacing a symlink at that name rather than
/// writing through it.
fn place_file(
    root: &Path,
    rel: &str,
    contents: &[u8],
    mode: Option<u32>,
) -> Result<(), ComposeError> {
    let rel = Path::new(rel);
    let parent = resolve_beneath(root, rel.parent().unwrap_or(Path::new("")))
        .map_err(|source| ComposeError::Read {
            path: root.join(rel),
            source,
        })?;
    create_dir_0755(&parent)?;

    let path = match rel.file_name() {
        Some(name) => parent.join(name),
        None => return Err(ComposeError::Incomplete(rel.display().to_string())),
    };
    if std::fs::symlink_metadata(&path).is_ok_and(|m| m.file_type().is_symlink()) {
        std::fs::remove_file(&path).map_err(|source| ComposeError::Write {
            path: path.clone(),
            source,
        })?;
    }
    write_file(&path, contents)?;
    if let Some(mode) = mode {
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(|source| ComposeError::Write { path, source })?;
    }
    Ok(())
}

fn create_dir_0755(path: &Path) -> Result<(), ComposeError> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .and_then(|()| std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)))
        .map_err(|source| ComposeError::Write {
            path: path.to_path_buf(),
            source,
        })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), ComposeError> {
    std::fs::write(path, contents).map_err(|source| ComposeError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_script(dir: &Path) -> PathBuf {
        let path = dir.join("overlay-init.sh");
        std::fs::write(&path, b"#!/bin/sh\nexec /sbin/init\n").unwrap();
        path
    }

    #[test]
    fn composes_full_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let script = init_script(dir.path());

        OverlayComposer::default()
            .add_overlay_support(&root, &script)
            .unwrap();

        verify_layout(&root).unwrap();
        for d in OVERLAY_DIRS {
            let mode = std::fs::metadata(root.join(d)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755, "{d}");
        }
        let init = root.join(OVERLAY_INIT);
        assert_eq!(
            std::fs::read(&init).unwrap(),
            b"#!/bin/sh\nexec /sbin/init\n"
        );
        assert_eq!(
            std::fs::metadata(&init).unwrap().permissions().mode() & 0o777,
            0o755
        );
        assert_eq!(
            std::fs::read_to_string(root.join("etc/resolv.conf")).unwrap(),
            "nameserver 8.8.8.8\n"
        );
    }

    #[test]
    fn composing_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let script = init_script(dir.path());
        let composer = OverlayComposer::default();

        composer.add_overlay_support(dir.path(), &script).unwrap();
        composer.add_overlay_support(dir.path(), &script).unwrap();
        verify_layout(dir.path()).unwrap();
    }

    #[test]
    fn custom_nameservers() {
        let dir = tempfile::tempdir().unwrap();
        let script = init_script(dir.path());
        let composer =
            OverlayComposer::new(vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)]);

        composer.add_overlay_support(dir.path(), &script).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("etc/resolv.conf")).unwrap(),
            "nameserver 1.1.1.1\nnameserver 9.9.9.9\n"
        );
    }

    #[test]
    fn replaces_resolv_conf_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let script = init_script(dir.path());
        std::fs::create_dir(dir.path().join("etc")).unwrap();
        std::os::unix::fs::symlink(
            "../run/systemd/resolve/stub-resolv.conf",
            dir.path().join("etc/resolv.conf"),
        )
        .unwrap();

        OverlayComposer::default()
            .add_overlay_support(dir.path(), &script)
            .unwrap();
        let meta = std::fs::symlink_metadata(dir.path().join("etc/resolv.conf")).unwrap();
        assert!(meta.is_file());
    }

    #[test]
    fn absolute_symlinks_stay_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let script = init_script(dir.path());
        let host = dir.path().join("host");
        std::fs::create_dir_all(host.join("sbin")).unwrap();
        std::fs::create_dir_all(host.join("etc")).unwrap();

        let root = dir.path().join("root");
        std::fs::create_dir_all(root.join("usr/sbin")).unwrap();
        std::os::unix::fs::symlink(host.join("sbin"), root.join("sbin")).unwrap();
        std::os::unix::fs::symlink(host.join("etc"), root.join("etc")).unwrap();
        std::os::unix::fs::symlink(host.join("etc"), root.join("mnt")).unwrap();

        OverlayComposer::default()
            .add_overlay_support(&root, &script)
            .unwrap();

        assert_eq!(std::fs::read_dir(host.join("sbin")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(host.join("etc")).unwrap().count(), 0);
        // Re-anchored at the rootfs: `<host>/sbin` inside the tree.
        let anchored = resolve_beneath(&root, Path::new("sbin")).unwrap();
        assert!(anchored.starts_with(&root));
        assert!(anchored.join("overlay-init").is_file());
        verify_layout(&root).unwrap();
    }

    #[test]
    fn relative_symlinks_resolve_within_tree() {
        let dir = tempfile::tempdir().unwrap();
        let script = init_script(dir.path());
        std::fs::create_dir_all(dir.path().join("usr/sbin")).unwrap();
        std::os::unix::fs::symlink("usr/sbin", dir.path().join("sbin")).unwrap();

        OverlayComposer::default()
            .add_overlay_support(dir.path(), &script)
            .unwrap();
        assert!(dir.path().join("usr/sbin/overlay-init").is_file());
        verify_layout(dir.path()).unwrap();
    }

    #[test]
    fn resolve_clamps_parent_dir_at_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::os::unix::fs::symlink("../../..", root.join("up")).unwrap();

        assert_eq!(resolve_beneath(&root, Path::new("up/etc")).unwrap(), root.join("etc"));
        assert_eq!(resolve_beneath(&root, Path::new("../x")).unwrap(), root.join("x"));
    }

    #[test]
    fn symlink_loop_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("b", dir.path().join("a")).unwrap();
        std::os::unix::fs::symlink("a", dir.path().join("b")).unwrap();
        assert!(resolve_beneath(dir.path(), Path::new("a/x")).is_err());
    }

    #[test]
    fn missing_init_script_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = OverlayComposer::default()
            .add_overlay_support(dir.path(), &dir.path().join("missing.sh"))
            .unwrap_err();
        assert!(matches!(err, ComposeError::Read { .. }));
    }

    #[test]
    fn verify_layout_reports_missing_entries() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            verify_layout(dir.path()),
            Err(ComposeError::Incomplete(d)) if d == "overlay/work"
        ));

        for d in OVERLAY_DIRS {
            std::fs::create_dir_all(dir.path().join(d)).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("sbin")).unwrap();
        std::fs::write(dir.path().join(OVERLAY_INIT), b"").unwrap();
        assert!(matches!(
            verify_layout(dir.path()),
            Err(ComposeError::Incomplete(d)) if d == OVERLAY_INIT
        ));
    }
}

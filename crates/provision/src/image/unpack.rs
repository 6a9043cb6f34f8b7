use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Apply layer archives to `root` in order, lowest layer first.
pub fn unpack_layers(layers: &[PathBuf], root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    for layer in layers {
        unpack_layer(layer, root)?;
    }
    Ok(())
}

fn open_layer(path: &Path) -> std::io::Result<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    if n == magic.len() && magic == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Unpack one layer, honouring OCI whiteouts.
///
/// `.wh.<name>` removes `<name>` from lower layers; `.wh..wh..opq` empties
/// the directory of anything this layer did not itself write.
fn unpack_layer(layer: &Path, root: &Path) -> std::io::Result<()> {
    let mut archive = tar::Archive::new(open_layer(layer)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    let mut written: HashSet<PathBuf> = HashSet::new();
    let mut entries = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(rel) = normalize(&path) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("layer entry escapes root: {}", path.display()),
            ));
        };
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if name == OPAQUE_MARKER {
            if let Some(dir) = real_dir(root, &parent)? {
                clear_lower_entries(&dir, &parent, &written)?;
            }
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            if hidden.is_empty() || hidden == "." || hidden == ".." {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid whiteout entry: {}", path.display()),
                ));
            }
            if let Some(dir) = real_dir(root, &parent)? {
                remove_path(&dir.join(hidden))?;
            }
            continue;
        }

        entry.unpack_in(root)?;
        written.insert(rel);
        entries += 1;
    }
    debug!(layer = %layer.display(), entries, "layer unpacked");
    Ok(())
}

/// Relative path with `.` and leading `/` dropped; `None` if it climbs out.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(out)
}

/// `root/rel` when every component of `rel` is a real directory; `None` if
/// one is missing. A symlinked component is an error: whiteouts only ever
/// act on the tree being unpacked.
fn real_dir(root: &Path, rel: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut dir = root.to_path_buf();
    for component in rel.components() {
        let Component::Normal(part) = component else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("whiteout parent escapes root: {}", rel.display()),
            ));
        };
        dir.push(part);
        let meta = match std::fs::symlink_metadata(&dir) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if meta.file_type().is_symlink() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("whiteout through symlink: {}", rel.display()),
            ));
        }
        if !meta.is_dir() {
            return Ok(None);
        }
    }
    Ok(Some(dir))
}

fn clear_lower_entries(dir: &Path, rel_dir: &Path, keep: &HashSet<PathBuf>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if keep.contains(&rel_dir.join(entry.file_name())) {
            continue;
        }
        remove_path(&entry.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

//! In-process stand-ins for the host, the machine backend and image
//! registries, for tests that exercise provisioning without root.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing
)]

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use machine::{Machine, MachineBackend, MachineConfig, MachineError};

use crate::command::{CommandError, CommandRunner, HostCommand};
use crate::image::{ImageSource, PullError};

const FS_MAGIC: &str = "FAKEFS:";

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Tap { multi_queue: bool },
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    pub index: u32,
    pub kind: LinkKind,
    pub up: bool,
    pub master: Option<String>,
    pub addrs: Vec<String>,
}

#[derive(Default)]
struct HostState {
    commands: Vec<String>,
    failing_programs: Vec<String>,
    failing_matches: Vec<String>,
    links: BTreeMap<String, FakeLink>,
    next_index: u32,
    /// mount point -> backing directory
    mounts: HashMap<PathBuf, PathBuf>,
}

/// A [`CommandRunner`] that simulates the host programs provisioning uses.
///
/// Filesystem images are plain files tagged with an id; their contents live
/// in a private backing directory that `mount` copies in and `umount` copies
/// back. `mksquashfs` writes a sorted manifest of the packed tree. `ip`
/// commands act on an in-memory link table.
pub struct FakeHost {
    state: Mutex<HostState>,
    store: tempfile::TempDir,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_index: 2,
                ..Default::default()
            }),
            store: tempfile::tempdir().expect("create fake host store"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every command run so far, in display form.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of invocations of `program`.
    pub fn count(&self, program: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.split(' ').next() == Some(program))
            .count()
    }

    /// Make every invocation of `program` fail.
    pub fn fail_program(&self, program: &str) {
        self.lock().failing_programs.push(program.to_string());
    }

    /// Make every command whose display form contains `pattern` fail.
    pub fn fail_matching(&self, pattern: &str) {
        self.lock().failing_matches.push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_programs.clear();
        state.failing_matches.clear();
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.lock().links.get(name).cloned()
    }

    pub fn link_names(&self) -> Vec<String> {
        self.lock().links.keys().cloned().collect()
    }

    /// Pre-create a link, as if left behind by an earlier process.
    pub fn add_link(&self, name: &str, kind: LinkKind) {
        let mut state = self.lock();
        let index = state.next_index;
        state.next_index += 1;
        state.links.insert(
            name.to_string(),
            FakeLink {
                index,
                kind,
                up: false,
                master: None,
                addrs: Vec::new(),
            },
        );
    }

    /// Create a formatted image at `path` and fill it through `populate`.
    pub fn make_image(&self, path: &Path, populate: impl FnOnce(&Path)) {
        if !path.exists() {
            std::fs::File::create(path).unwrap();
        }
        let root = self.format(path).unwrap();
        populate(&root);
    }

    /// Backing directory holding the contents of the image at `path`.
    pub fn image_root(&self, path: &Path) -> PathBuf {
        self.backing_dir(path).expect("not a fake filesystem image")
    }

    fn format(&self, image: &Path) -> std::io::Result<PathBuf> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut file = std::fs::OpenOptions::new().write(true).open(image)?;
        file.write_all(format!("{FS_MAGIC}{id}\n").as_bytes())?;
        let root = self.store.path().join(id);
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    fn backing_dir(&self, image: &Path) -> Option<PathBuf> {
        let mut header = [0u8; 64];
        let mut file = std::fs::File::open(image).ok()?;
        let n = file.read(&mut header).ok()?;
        let header = std::str::from_utf8(&header[..n]).ok()?;
        let id = header.strip_prefix(FS_MAGIC)?.lines().next()?;
        Some(self.store.path().join(id))
    }

    fn simulate(&self, program: &str, args: &[String]) -> Result<String, String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match program {
            "mkfs.ext4" => {
                let image = args.last().ok_or("missing device")?;
                self.format(Path::new(image)).map_err(|e| e.to_string())?;
                Ok(String::new())
            }
            "mount" => self.simulate_mount(&args),
            "umount" => self.simulate_umount(&args),
            "mksquashfs" => simulate_mksquashfs(&args),
            "ip" => self.simulate_ip(&args),
            _ => Ok(String::new()),
        }
    }

    fn simulate_mount(&self, args: &[&str]) -> Result<String, String> {
        let [.., image, target] = args else {
            return Err("usage: mount <image> <dir>".into());
        };
        let backing = self
            .backing_dir(Path::new(image))
            .ok_or_else(|| format!("wrong fs type, bad superblock on {image}"))?;
        copy_tree(&backing, Path::new(target)).map_err(|e| e.to_string())?;
        self.lock().mounts.insert(PathBuf::from(target), backing);
        Ok(String::new())
    }

    fn simulate_umount(&self, args: &[&str]) -> Result<String, String> {
        let target = PathBuf::from(args.last().ok_or("missing target")?);
        let backing = self
            .lock()
            .mounts
            .remove(&target)
            .ok_or_else(|| format!("{}: not mounted", target.display()))?;
        std::fs::remove_dir_all(&backing).map_err(|e| e.to_string())?;
        std::fs::create_dir_all(&backing).map_err(|e| e.to_string())?;
        copy_tree(&target, &backing).map_err(|e| e.to_string())?;
        clear_dir(&target).map_err(|e| e.to_string())?;
        Ok(String::new())
    }

    fn simulate_ip(&self, args: &[&str]) -> Result<String, String> {
        let mut state = self.lock();
        match args {
            ["link", "show", "dev", name] | ["-o", "link", "show", "dev", name] => state
                .links
                .get(*name)
                .map(|l| link_line(name, l))
                .ok_or_else(|| format!("Device \"{name}\" does not exist.")),
            ["-o", "link", "show"] => Ok(state
                .links
                .iter()
                .map(|(name, l)| link_line(name, l))
                .collect::<Vec<_>>()
                .join("\n")),
            ["link", "add", "name", name, "type", "bridge"] => {
                if state.links.contains_key(*name) {
                    return Err("RTNETLINK answers: File exists".into());
                }
                insert_link(&mut state, name, LinkKind::Bridge);
                Ok(String::new())
            }
            ["tuntap", "add", "dev", name, "mode", "tap", rest @ ..] => {
                if state.links.contains_key(*name) {
                    return Err("ioctl(TUNSETIFF): Device or resource busy".into());
                }
                let multi_queue = rest.contains(&"multi_queue");
                insert_link(&mut state, name, LinkKind::Tap { multi_queue });
                Ok(String::new())
            }
            ["addr", "add", cidr, "dev", name] => {
                let link = state
                    .links
                    .get_mut(*name)
                    .ok_or_else(|| format!("Cannot find device \"{name}\""))?;
                if link.addrs.iter().any(|a| a.as_str() == *cidr) {
                    return Err("RTNETLINK answers: File exists".into());
                }
                link.addrs.push(cidr.to_string());
                Ok(String::new())
            }
            ["link", "set", "dev", name, "up"] => {
                let link = state
                    .links
                    .get_mut(*name)
                    .ok_or_else(|| format!("Cannot find device \"{name}\""))?;
                link.up = true;
                Ok(String::new())
            }
            ["link", "set", "dev", name, "master", bridge] => {
                if !state.links.contains_key(*bridge) {
                    return Err(format!("Cannot find device \"{bridge}\""));
                }
                let link = state
                    .links
                    .get_mut(*name)
                    .ok_or_else(|| format!("Cannot find device \"{name}\""))?;
                link.master = Some(bridge.to_string());
                Ok(String::new())
            }
            ["link", "del", name] | ["link", "del", "dev", name] => state
                .links
                .remove(*name)
                .map(|_| String::new())
                .ok_or_else(|| format!("Cannot find device \"{name}\"")),
            ["-4", "-o", "addr", "show", "dev", name] => {
                let link = state
                    .links
                    .get(*name)
                    .ok_or_else(|| format!("Device \"{name}\" does not exist."))?;
                Ok(link
                    .addrs
                    .iter()
                    .map(|cidr| {
                        format!(
                            "{}: {name}    inet {cidr} scope global {name}\\       \
                             valid_lft forever preferred_lft forever",
                            link.index
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            _ => Err(format!("unsupported ip invocation: {}", args.join(" "))),
        }
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, command: &HostCommand) -> Result<String, CommandError> {
        let display = command.display();
        let program = command.program().to_string_lossy().into_owned();
        let args: Vec<String> = command
            .get_args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let injected = {
            let mut state = self.lock();
            state.commands.push(display.clone());
            state.failing_programs.contains(&program)
                || state.failing_matches.iter().any(|m| display.contains(m))
        };
        if injected {
            return Err(CommandError {
                command: display,
                detail: "injected failure".into(),
            });
        }

        self.simulate(&program, &args).map_err(|detail| CommandError {
            command: display,
            detail,
        })
    }
}

fn insert_link(state: &mut HostState, name: &str, kind: LinkKind) {
    let index = state.next_index;
    state.next_index += 1;
    state.links.insert(
        name.to_string(),
        FakeLink {
            index,
            kind,
            up: false,
            master: None,
            addrs: Vec::new(),
        },
    );
}

fn link_line(name: &str, link: &FakeLink) -> String {
    let flags = if link.up {
        "BROADCAST,MULTICAST,UP,LOWER_UP"
    } else {
        "BROADCAST,MULTICAST"
    };
    let master = link
        .master
        .as_ref()
        .map(|m| format!(" master {m}"))
        .unwrap_or_default();
    let state = if link.up { "UP" } else { "DOWN" };
    format!(
        "{}: {name}: <{flags}> mtu 1500 qdisc noop{master} state {state} mode DEFAULT \
         group default qlen 1000\\    link/ether 06:00:00:00:00:{:02x} brd ff:ff:ff:ff:ff:ff",
        link.index, link.index
    )
}

fn simulate_mksquashfs(args: &[&str]) -> Result<String, String> {
    let [source, output, ..] = args else {
        return Err("usage: mksquashfs <source> <output>".into());
    };
    let mut lines = Vec::new();
    manifest(Path::new(source), Path::new(source), &mut lines).map_err(|e| e.to_string())?;
    lines.sort();
    std::fs::write(output, lines.join("\n") + "\n").map_err(|e| e.to_string())?;
    Ok(String::new())
}

fn manifest(root: &Path, dir: &Path, lines: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path.as_path())
            .display()
            .to_string();
        let meta = std::fs::symlink_metadata(&path)?;
        let mode = meta.permissions().mode() & 0o7777;
        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            lines.push(format!("l {rel} -> {}", target.display()));
        } else if meta.is_dir() {
            lines.push(format!("d {mode:04o} {rel}"));
            manifest(root, &path, lines)?;
        } else {
            lines.push(format!("f {mode:04o} {rel} {}", meta.len()));
        }
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&src)?;
        if meta.file_type().is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(&src)?, &dst)?;
        } else if meta.is_dir() {
            copy_tree(&src, &dst)?;
            std::fs::set_permissions(&dst, meta.permissions())?;
        } else {
            std::fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if std::fs::symlink_metadata(&path)?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    started: Mutex<Vec<MachineConfig>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    start_delay: Mutex<Option<Duration>>,
    stop_delay: Mutex<Option<Duration>>,
    stops: AtomicUsize,
}

/// A [`MachineBackend`] that records what it was asked to boot.
#[derive(Default, Clone)]
pub struct FakeBackend {
    state: Arc<BackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<MachineConfig> {
        self.state
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stops(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Delay every start by `delay` before it completes.
    pub fn set_start_delay(&self, delay: Option<Duration>) {
        *self
            .state
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Delay every stop by `delay` before it reports its outcome.
    pub fn set_stop_delay(&self, delay: Option<Duration>) {
        *self
            .state
            .stop_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }
}

#[async_trait]
impl MachineBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self, config: MachineConfig) -> machine::Result<Box<dyn Machine>> {
        let delay = *self
            .state
            .start_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(MachineError::StartFailed("injected start failure".into()));
        }
        let id = config.id.clone();
        self.state
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(config);
        Ok(Box::new(FakeMachine {
            id,
            state: Arc::clone(&self.state),
            stopped: false,
        }))
    }
}

struct FakeMachine {
    id: String,
    state: Arc<BackendState>,
    stopped: bool,
}

#[async_trait]
impl Machine for FakeMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        (!self.stopped).then_some(4242)
    }

    async fn stop(&mut self) -> machine::Result<()> {
        let delay = *self
            .state
            .stop_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_stop.load(Ordering::SeqCst) {
            return Err(MachineError::StopFailed("injected stop failure".into()));
        }
        if !self.stopped {
            self.stopped = true;
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeSource
// ---------------------------------------------------------------------------

/// An [`ImageSource`] serving in-memory tar layers.
#[derive(Default)]
pub struct FakeSource {
    images: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    pulls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reference` with `layers` (tar or tar.gz bytes, lowest first).
    pub fn with_image(self, reference: &str, layers: Vec<Vec<u8>>) -> Self {
        self.images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.to_string(), layers);
        self
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Build an uncompressed tar layer from `(path, contents)` pairs.
    ///
    /// Paths ending in `/` become directories.
    pub fn tar_layer(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            if path.ends_with('/') {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .unwrap();
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(data.len() as u64);
                builder
                    .append_data(&mut header, path, data.as_bytes())
                    .unwrap();
            }
        }
        builder.into_inner().unwrap()
    }

    /// Gzip-compress `layer`.
    pub fn gzip(layer: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(layer).unwrap();
        encoder.finish().unwrap()
    }
}

#[async_trait]
impl ImageSource for FakeSource {
    async fn pull(&self, reference: &str, dest: &Path) -> Result<Vec<PathBuf>, PullError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let layers = self
            .images
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| PullError::Registry(format!("manifest unknown: {reference}")))?;

        tokio::fs::create_dir_all(dest).await?;
        let mut paths = Vec::with_capacity(layers.len());
        for (i, layer) in layers.iter().enumerate() {
            let path = dest.join(format!("layer-{i}"));
            tokio::fs::write(&path, layer).await?;
            paths.push(path);
        }
        Ok(paths)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Rootfs assembler (spec.md 4.8): orders image mounts, mounts `/dev` +
//! `proc` + `sys`, populates `/dev`, and performs the root switch.

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use log::{debug, info, warn};
use nix::mount::{mount, umount, MsFlags};
use nix::unistd::{chdir, chroot};
use std::os::unix::fs::FileTypeExt;
use std::sync::Mutex;

use crate::error::{CryptvolError, Result};
use crate::mount::{mount_one, MountContext, MountEntry};

/// Device basenames copied into `<root>/dev` during pre-exec, matching the
/// original's fixed allow-list rather than mirroring every host `/dev` node.
const DEV_ALLOWLIST: &[&str] = &[
    "null", "zero", "full", "random", "urandom", "tty", "ptmx", "console", "fuse", "ashmem",
];

lazy_static! {
    /// First-creator-wins guard for the process-wide shared bind-file store
    /// (spec.md 3, 5, 9: "Global state").
    static ref FILES_SHARED_MOUNTED: Mutex<bool> = Mutex::new(false);
}

/// Whether the root switch uses `pivot_root` (hosted) or move-mount+`chroot`
/// (bare). A single policy flag, never interleaved logic (spec.md 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSwitchPolicy {
    Hosted,
    Bare,
}

/// pre-clone: select the volume mode from on-disk policy. Delegates to the
/// `mode` module (spec.md 4.9); kept here only as the named lifecycle hook.
pub fn pre_clone(images_dir: &Path, is_privileged: bool) -> Result<crate::volume::VolumeMode> {
    crate::mode::select_mode(images_dir, is_privileged)
}

/// child-early: still in the host mount namespace. Creates the container
/// root, mounts every declared entry in order, ensures the shared store, and
/// tmpfs-mounts `<root>/dev`.
pub fn child_early(
    container_root: &Path,
    images_dir: &Path,
    entries: &[MountEntry],
    ctx: &MountContext,
) -> Result<()> {
    std::fs::create_dir_all(container_root).map_err(crate::error::io_ctx(format!("creating {container_root:?}")))?;
    std::fs::create_dir_all(images_dir).map_err(crate::error::io_ctx(format!("creating {images_dir:?}")))?;

    for entry in entries {
        mount_one(container_root, entry, ctx)?;
    }

    ensure_shared_store(images_dir, container_root)?;

    let dev_dir = container_root.join("dev");
    std::fs::create_dir_all(&dev_dir).map_err(crate::error::io_ctx(format!("creating {dev_dir:?}")))?;
    mount(Some("tmpfs"), &dev_dir, Some("tmpfs"), MsFlags::MS_NOSUID, Some("mode=0755"))
        .map_err(|errno| CryptvolError::MountFailed { target: dev_dir.display().to_string(), errno })?;

    Ok(())
}

fn ensure_shared_store(images_dir: &Path, container_root: &Path) -> Result<()> {
    let mut guard = FILES_SHARED_MOUNTED.lock().expect("lock poisoned");
    if *guard {
        debug!("files_shared already mounted by a prior container, skipping");
        return Ok(());
    }
    let store_dir = images_dir.join("files_shared");
    let store_img = store_dir.join("_store.img");
    if !store_img.exists() {
        std::fs::create_dir_all(&store_dir).map_err(crate::error::io_ctx(format!("creating {store_dir:?}")))?;
        crate::image::create_empty(&store_img, None, 100)?;
    }
    let target = container_root.join("files_shared");
    std::fs::create_dir_all(&target).map_err(crate::error::io_ctx(format!("creating {target:?}")))?;

    let mut lc = loopdev::LoopControl::open().map_err(|e| CryptvolError::LoopAllocFailed(e.to_string()))?;
    let ld = lc.next_free().map_err(|e| CryptvolError::LoopAllocFailed(e.to_string()))?;
    ld.attach_file(&store_img).map_err(|e| CryptvolError::LoopAllocFailed(e.to_string()))?;
    let dev = ld
        .path()
        .and_then(|p| p.to_str().map(str::to_string))
        .ok_or_else(|| CryptvolError::LoopAllocFailed(format!("loop device for {store_img:?} has no path")))?;
    crate::dm::wait_for_device(Path::new(&dev), std::time::Duration::from_millis(500))?;

    match mount(Some(dev.as_str()), &target, Some("ext4"), MsFlags::MS_NOATIME, None::<&str>) {
        Ok(()) => {}
        Err(nix::errno::Errno::EINVAL) => {
            let status = std::process::Command::new("mkfs.ext4")
                .arg("-q")
                .arg(&dev)
                .status()
                .map_err(|e| CryptvolError::FormatFailed(e.to_string()))?;
            if !status.success() {
                return Err(CryptvolError::FormatFailed(format!("mkfs.ext4 exited with {status}")));
            }
            mount(Some(dev.as_str()), &target, Some("ext4"), MsFlags::MS_NOATIME, None::<&str>)
                .map_err(|errno| CryptvolError::MountFailed { target: target.display().to_string(), errno })?;
        }
        Err(errno) => return Err(CryptvolError::MountFailed { target: target.display().to_string(), errno }),
    }

    *guard = true;
    Ok(())
}

/// post-clone: for every verity-protected shared image, a background child
/// performs a full integrity scan. The scan itself belongs to the external
/// verity collaborator (Non-goal); this hook only owns forking the child and
/// reporting completion via `on_complete`.
pub fn post_clone(verity_images: &[String], on_complete: impl Fn(&str, bool) + Send + 'static) -> Result<()> {
    for image in verity_images {
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { child, .. }) => {
                debug!("forked verity scan child {child} for {image}");
            }
            Ok(nix::unistd::ForkResult::Child) => {
                // In the real system this execs/calls into the verity
                // scanner; here the child reports success and exits.
                on_complete(image, true);
                std::process::exit(0);
            }
            Err(e) => warn!("fork for verity scan of {image} failed: {e}"),
        }
    }
    Ok(())
}

/// pre-exec: populate `<root>/dev` by copying the allow-listed host device
/// nodes and symlinking the first `tty*` found to `console`.
pub fn populate_dev(container_root: &Path) -> Result<()> {
    let dev_dir = container_root.join("dev");
    let host_dev = Path::new("/dev");

    let mut first_tty: Option<PathBuf> = None;
    for entry in std::fs::read_dir(host_dev).map_err(crate::error::io_ctx("reading /dev"))? {
        let entry = entry.map_err(crate::error::io_ctx("reading /dev entry"))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("binder") {
            // binder* is allow-listed by prefix, not exact name.
        } else if !DEV_ALLOWLIST.contains(&name.as_ref()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.is_dir() {
            continue; // mountpoints under /dev are never copied verbatim
        }
        let dst = dev_dir.join(name.as_ref());
        copy_device_node(&entry.path(), &dst)?;
        if name.starts_with("tty") && first_tty.is_none() {
            first_tty = Some(dst.clone());
        }
    }

    if let Some(tty) = first_tty {
        let console = dev_dir.join("console");
        let _ = std::fs::remove_file(&console);
        std::os::unix::fs::symlink(&tty, &console).map_err(crate::error::io_ctx("symlinking console"))?;
    }

    Ok(())
}

fn copy_device_node(src: &Path, dst: &Path) -> Result<()> {
    use nix::sys::stat::{mknod, Mode, SFlag};
    let meta = std::fs::metadata(src).map_err(crate::error::io_ctx(format!("stat {src:?}")))?;
    if meta.file_type().is_char_device() {
        use std::os::unix::fs::MetadataExt;
        let dev = meta.rdev();
        let _ = mknod(dst, SFlag::S_IFCHR, Mode::from_bits_truncate(0o666), dev);
    } else if meta.is_file() {
        let _ = std::fs::copy(src, dst);
    }
    Ok(())
}

/// child: remount `/proc`, mount `<root>/proc` and `<root>/sys`, switch root,
/// mount `devpts`/`tmpfs /run`/the socket directory, and in setup mode
/// install the busybox applet farm.
pub fn child(
    container_root: &Path,
    socket_dir: &Path,
    policy: RootSwitchPolicy,
    setup_mode: bool,
    lxcfs_proc_overlay: Option<&Path>,
    busybox_applets: &[&str],
) -> Result<()> {
    mount(None::<&str>, "/proc", None::<&str>, MsFlags::MS_REMOUNT, None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: "/proc".into(), errno })?;

    let proc_dir = container_root.join("proc");
    mount(Some("proc"), &proc_dir, Some("proc"), MsFlags::empty(), None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: proc_dir.display().to_string(), errno })?;

    if let Some(lxcfs) = lxcfs_proc_overlay {
        let flags = MsFlags::MS_BIND;
        mount(Some(lxcfs), &proc_dir, None::<&str>, flags, None::<&str>)
            .map_err(|errno| CryptvolError::MountFailed { target: proc_dir.display().to_string(), errno })?;
    }

    let sys_dir = container_root.join("sys");
    mount(Some("sysfs"), &sys_dir, Some("sysfs"), MsFlags::empty(), None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: sys_dir.display().to_string(), errno })?;

    switch_root(container_root, policy)?;

    let run_dir = Path::new("/run");
    mount(Some("tmpfs"), run_dir, Some("tmpfs"), MsFlags::MS_NOSUID | MsFlags::MS_NODEV, Some("mode=0755"))
        .map_err(|errno| CryptvolError::MountFailed { target: "/run".into(), errno })?;
    // The source distilled this into two identical `chmod /run 0755` calls;
    // spec.md 9 records that as harmless duplication and asks for one call.
    nix::sys::stat::fchmodat(
        None,
        run_dir,
        nix::sys::stat::Mode::from_bits_truncate(0o755),
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )
    .map_err(CryptvolError::from)?;

    let devpts = Path::new("/dev/pts");
    std::fs::create_dir_all(devpts).map_err(crate::error::io_ctx("creating /dev/pts"))?;
    mount(Some("devpts"), devpts, Some("devpts"), MsFlags::empty(), None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: "/dev/pts".into(), errno })?;

    std::fs::create_dir_all(socket_dir).map_err(crate::error::io_ctx(format!("creating {socket_dir:?}")))?;
    mount(Some(socket_dir), socket_dir, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: socket_dir.display().to_string(), errno })?;

    if setup_mode {
        install_busybox_farm(busybox_applets)?;
    }

    Ok(())
}

fn switch_root(container_root: &Path, policy: RootSwitchPolicy) -> Result<()> {
    match policy {
        RootSwitchPolicy::Hosted => {
            let old_root = container_root.join(".old_root");
            std::fs::create_dir_all(&old_root).map_err(crate::error::io_ctx("creating pivot_root old-root dir"))?;
            nix::unistd::pivot_root(container_root, &old_root).map_err(CryptvolError::from)?;
            chdir("/").map_err(CryptvolError::from)?;
            umount2_lazy(Path::new("/.old_root"))?;
        }
        RootSwitchPolicy::Bare => {
            chdir(container_root).map_err(CryptvolError::from)?;
            mount(Some("."), "/", None::<&str>, MsFlags::MS_MOVE, None::<&str>).map_err(CryptvolError::from)?;
            chroot(".").map_err(CryptvolError::from)?;
            chdir("/").map_err(CryptvolError::from)?;
        }
    }
    info!("root switch complete ({policy:?})");
    Ok(())
}

fn umount2_lazy(path: &Path) -> Result<()> {
    match umount(path) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("unmounting old root {path:?} failed (non-fatal): {e}");
            Ok(())
        }
    }
}

/// Install a fixed applet symlink farm under `/bin` and `/sbin`, all pointing
/// at `busybox`. Busybox itself is an external filesystem-utility dependency
/// (Non-goals); the applet list is supplied by the caller rather than probed
/// via `busybox --list`, keeping this crate's contract narrow (SPEC_FULL 9.5).
fn install_busybox_farm(applets: &[&str]) -> Result<()> {
    for dir in ["/bin", "/sbin"] {
        std::fs::create_dir_all(dir).map_err(crate::error::io_ctx(format!("creating {dir}")))?;
        for applet in applets {
            let link = Path::new(dir).join(applet);
            let _ = std::fs::remove_file(&link);
            std::os::unix::fs::symlink("/bin/busybox", &link)
                .map_err(crate::error::io_ctx(format!("symlinking {link:?}")))?;
        }
    }
    Ok(())
}

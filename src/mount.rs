// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mount entry driver (spec.md 4.6): for each declared mount entry, selects
//! a backing device, mounts it (plain/bind/overlay), and enforces flags.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::mount::{mount, MsFlags};

use crate::dm::DM;
use crate::error::{CryptvolError, Result};
use crate::overlay;
use crate::util::SecretHex;
use crate::volume::{self, VolumeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountType {
    Shared,
    SharedRw,
    OverlayRo,
    OverlayRw,
    Device,
    DeviceRw,
    Empty,
    Copy,
    Flash,
    BindFile,
    BindFileRw,
    BindDir,
    BindDirRw,
}

#[derive(Debug, Clone)]
pub struct MountEntry {
    pub mount_type: MountType,
    pub image_name: String,
    pub target_dir: PathBuf,
    pub fs_type: Option<String>,
    pub mount_data: Option<String>,
    pub size_mb: u64,
    pub encrypted: bool,
    pub verity_root_hash: Option<String>,
}

/// Per-container context a mount operation needs but which isn't part of the
/// entry itself: where images live, whether this is a setup-mode start, the
/// container's key (if any), the dm-control handle, and the volume mode
/// selected for it at pre-clone (spec.md 4.4/4.9). `dm` is only required when
/// an entry is actually `encrypted`, so unencrypted mount sets never need a
/// live dm-control handle.
pub struct MountContext<'a> {
    pub images_dir: PathBuf,
    pub container_uuid: String,
    pub setup_mode: bool,
    pub key: Option<&'a SecretHex>,
    pub dm: Option<&'a DM>,
    pub mode: VolumeMode,
}

fn default_flags(ctx: &MountContext) -> MsFlags {
    let mut flags = MsFlags::MS_NOATIME | MsFlags::MS_NODEV;
    if ctx.setup_mode {
        flags.remove(MsFlags::MS_NODEV);
    }
    flags
}

fn backing_image_path(ctx: &MountContext, entry: &MountEntry) -> PathBuf {
    ctx.images_dir.join(format!("{}.img", entry.image_name))
}

/// Backing path for the dm-integrity metadata image that accompanies
/// `entry.image_name` when `ctx.mode` stacks integrity (spec.md 6's
/// `<name>.meta.img` on-disk convention).
fn meta_image_path(ctx: &MountContext, entry: &MountEntry) -> PathBuf {
    ctx.images_dir.join(format!("{}.meta.img", entry.image_name))
}

/// Bind a free loop device to `path` and return its `/dev/loopN` path.
fn attach_loop(path: &Path) -> Result<String> {
    let mut lc = loopdev::LoopControl::open().map_err(|e| CryptvolError::LoopAllocFailed(e.to_string()))?;
    let ld = lc.next_free().map_err(|e| CryptvolError::LoopAllocFailed(e.to_string()))?;
    ld.attach_file(path).map_err(|e| CryptvolError::LoopAllocFailed(e.to_string()))?;
    ld.path()
        .and_then(|p| p.to_str().map(str::to_string))
        .ok_or_else(|| CryptvolError::LoopAllocFailed(format!("loop device for {path:?} has no path")))
}

/// Resolve the entry's image to a mountable block device path: a loop device
/// over the backing file (or, for verity-protected entries, the path an
/// external verity builder produced), then stack encryption on top if
/// `entry.encrypted` (spec.md 4.6, matching `c_vol.c`'s
/// `cryptfs_setup_volume_new` call at the equivalent step).
pub(crate) fn resolve_backing(ctx: &MountContext, entry: &MountEntry) -> Result<String> {
    let image_path = backing_image_path(ctx, entry);
    let label = format!("{}-{}", ctx.container_uuid, entry.image_name);

    let base = if let Some(root_hash) = &entry.verity_root_hash {
        debug!("entry {} is verity-protected (root hash {root_hash}), label {label}", entry.image_name);
        // The verity device itself is built by an external collaborator
        // (Non-goal); this crate only knows the path convention it uses.
        format!("/dev/mapper/{label}")
    } else {
        attach_loop(&image_path)?
    };

    crate::dm::wait_for_device(Path::new(&base), std::time::Duration::from_millis(500))?;

    if !entry.encrypted {
        return Ok(base);
    }

    let key = ctx.key.ok_or(CryptvolError::NoKey)?;
    let dm = ctx.dm.ok_or_else(|| CryptvolError::InvalidMode("encrypted entry but no dm-control handle".into()))?;
    let meta_path = meta_image_path(ctx, entry);
    let meta_dev = if ctx.mode.requires_meta_device() {
        let dev = attach_loop(&meta_path)?;
        crate::dm::wait_for_device(Path::new(&dev), std::time::Duration::from_millis(500))?;
        Some(dev)
    } else {
        None
    };

    debug!("entry {} requires encryption over {base}, label {label}", entry.image_name);
    volume::setup_volume(dm, &label, &base, key.as_str(), meta_dev.as_deref(), ctx.mode)
}

/// Mount a single entry under `root`. Dispatches on `entry.mount_type`
/// (spec.md 4.6).
pub fn mount_one(root: &Path, entry: &MountEntry, ctx: &MountContext) -> Result<()> {
    let target = root.join(entry.target_dir.strip_prefix("/").unwrap_or(&entry.target_dir));
    std::fs::create_dir_all(&target).map_err(crate::error::io_ctx(format!("creating {target:?}")))?;

    match entry.mount_type {
        MountType::Flash => {
            debug!("entry {} is flash-type, skipped at mount time", entry.image_name);
            return Ok(());
        }
        MountType::Shared | MountType::Device => {
            let dev = resolve_backing(ctx, entry)?;
            plain_mount(&dev, &target, entry, ctx, true)?;
        }
        MountType::DeviceRw => {
            let dev = resolve_backing(ctx, entry)?;
            plain_mount(&dev, &target, entry, ctx, false)?;
        }
        MountType::Empty | MountType::Copy => {
            let dev = resolve_backing(ctx, entry)?;
            match plain_mount(&dev, &target, entry, ctx, false) {
                Ok(()) => {}
                Err(CryptvolError::MountFailed { errno, .. }) if errno == nix::errno::Errno::EINVAL => {
                    format_device(&dev, entry.fs_type.as_deref().unwrap_or("ext4"))?;
                    plain_mount(&dev, &target, entry, ctx, false)?;
                }
                Err(e) => return Err(e),
            }
        }
        MountType::SharedRw | MountType::OverlayRo | MountType::OverlayRw => {
            overlay::mount_overlay(root, &target, entry, ctx)?;
        }
        MountType::BindFile | MountType::BindFileRw => {
            bind_file(root, &target, entry, ctx)?;
        }
        MountType::BindDir | MountType::BindDirRw => {
            bind_dir(&target, entry, ctx)?;
        }
    }

    apply_private(&target)?;
    Ok(())
}

fn plain_mount(dev: &str, target: &Path, entry: &MountEntry, ctx: &MountContext, readonly: bool) -> Result<()> {
    let mut flags = default_flags(ctx);
    if readonly {
        flags.insert(MsFlags::MS_RDONLY);
    }
    let fs_type = entry.fs_type.as_deref();
    let data = entry.mount_data.as_deref();
    mount(Some(dev), target, fs_type, flags, data).map_err(|errno| CryptvolError::MountFailed {
        target: target.display().to_string(),
        errno,
    })
}

fn format_device(dev: &str, fs_type: &str) -> Result<()> {
    // mkfs.* is an external filesystem utility (Non-goal); this crate
    // consumes it through its narrow CLI interface rather than
    // reimplementing filesystem formatting.
    let status = std::process::Command::new(format!("mkfs.{fs_type}"))
        .arg(dev)
        .status()
        .map_err(|e| CryptvolError::FormatFailed(e.to_string()))?;
    if !status.success() {
        return Err(CryptvolError::FormatFailed(format!("mkfs.{fs_type} exited with {status}")));
    }
    Ok(())
}

fn bind_file(root: &Path, target: &Path, entry: &MountEntry, ctx: &MountContext) -> Result<()> {
    let src = ctx.images_dir.join("files_shared").join(&entry.image_name);
    if !src.is_file() {
        std::fs::write(&src, []).map_err(crate::error::io_ctx(format!("creating bind-file source {src:?}")))?;
    }
    if !target.is_file() {
        std::fs::write(target, []).map_err(crate::error::io_ctx(format!("creating bind-file target {target:?}")))?;
    }
    let flags = default_flags(ctx) | MsFlags::MS_BIND;
    mount(Some(&src), target, None::<&str>, flags, None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: target.display().to_string(), errno })?;

    if entry.mount_type == MountType::BindFile {
        // Read-only bind mounts need a second remount pass; MS_BIND ignores
        // MS_RDONLY on the first call (kernel limitation, spec.md 4.6).
        let remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
        mount(None::<&str>, target, None::<&str>, remount, None::<&str>)
            .map_err(|errno| CryptvolError::MountFailed { target: target.display().to_string(), errno })?;
    }
    let _ = root;
    Ok(())
}

fn bind_dir(target: &Path, entry: &MountEntry, ctx: &MountContext) -> Result<()> {
    let src = PathBuf::from(&entry.image_name);
    if !src.is_absolute() {
        return Err(CryptvolError::MountFailed { target: target.display().to_string(), errno: nix::errno::Errno::EINVAL });
    }
    let flags = default_flags(ctx) | MsFlags::MS_BIND;
    mount(Some(&src), target, None::<&str>, flags, None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: target.display().to_string(), errno })?;

    if entry.mount_type == MountType::BindDir {
        let remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
        mount(None::<&str>, target, None::<&str>, remount, None::<&str>)
            .map_err(|errno| CryptvolError::MountFailed { target: target.display().to_string(), errno })?;
    }
    Ok(())
}

fn apply_private(target: &Path) -> Result<()> {
    let flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>)
        .map_err(|errno| CryptvolError::MountFailed { target: target.display().to_string(), errno })
}

/// Unmount a mount set in strict reverse order (spec.md 4.6, 5, testable
/// property 7).
pub fn unmount_all(root: &Path, entries: &[MountEntry]) -> Result<()> {
    for entry in entries.iter().rev() {
        if entry.mount_type == MountType::Flash {
            continue;
        }
        let target = root.join(entry.target_dir.strip_prefix("/").unwrap_or(&entry.target_dir));
        if let Err(e) = nix::mount::umount(&target) {
            warn!("unmounting {target:?} failed (continuing): {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn entry(mount_type: MountType, name: &str) -> MountEntry {
        MountEntry {
            mount_type,
            image_name: name.to_string(),
            target_dir: PathBuf::from(format!("/{name}")),
            fs_type: Some("ext4".to_string()),
            mount_data: None,
            size_mb: 16,
            encrypted: false,
            verity_root_hash: None,
        }
    }

    #[test]
    fn default_flags_drop_nodev_in_setup_mode() {
        let ctx = MountContext {
            images_dir: PathBuf::from("/tmp"),
            container_uuid: "c0".into(),
            setup_mode: true,
            key: None,
            dm: None,
            mode: VolumeMode::NotImplemented,
        };
        let flags = default_flags(&ctx);
        assert!(!flags.contains(MsFlags::MS_NODEV));
        assert!(flags.contains(MsFlags::MS_NOATIME));
    }

    #[test]
    fn default_flags_keep_nodev_normally() {
        let ctx = MountContext {
            images_dir: PathBuf::from("/tmp"),
            container_uuid: "c0".into(),
            setup_mode: false,
            key: None,
            dm: None,
            mode: VolumeMode::NotImplemented,
        };
        assert!(default_flags(&ctx).contains(MsFlags::MS_NODEV));
    }

    #[test]
    fn unmount_order_is_reversed() {
        // unmount_all walks entries.iter().rev(); verify the iteration order
        // directly rather than performing real mounts in a unit test.
        let entries = vec![entry(MountType::Device, "a"), entry(MountType::Device, "b"), entry(MountType::Device, "c")];
        let order: Vec<_> = entries.iter().rev().map(|e| e.image_name.clone()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn bind_dir_rejects_relative_source() {
        let ctx = MountContext {
            images_dir: PathBuf::from("/tmp"),
            container_uuid: "c0".into(),
            setup_mode: false,
            key: None,
            dm: None,
            mode: VolumeMode::NotImplemented,
        };
        let e = entry(MountType::BindDir, "relative/path");
        let target = PathBuf::from("/tmp/doesnotmatter");
        assert!(bind_dir(&target, &e, &ctx).is_err());
    }

    /// Mirrors spec.md section 8's S5: a `BindFile` entry sourced from
    /// `<images_dir>/files_shared/x` appears read-only at its target inside
    /// the rootfs. Needs root (mount(2) requires CAP_SYS_ADMIN); follows the
    /// teacher's `sudo_test_*` naming for root-only tests.
    #[test]
    fn sudo_test_s5_bind_file_is_read_only_at_target() {
        let images_dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(images_dir.path().join("files_shared")).unwrap();
        std::fs::write(images_dir.path().join("files_shared").join("x"), b"shared payload").unwrap();

        let ctx = MountContext {
            images_dir: images_dir.path().to_path_buf(),
            container_uuid: "sudo-test-s5".into(),
            setup_mode: false,
            key: None,
            dm: None,
            mode: VolumeMode::NotImplemented,
        };
        let e = entry(MountType::BindFile, "x");
        let target = root.path().join("x");

        bind_file(root.path(), &target, &e, &ctx).unwrap();

        let write_result = OpenOptions::new().write(true).open(&target);
        assert!(write_result.is_err(), "bind-mounted file must be read-only at target");

        let _ = nix::mount::umount(&target);
    }

    /// An `encrypted` entry must resolve to a `/dev/mapper/<uuid>-<image>`
    /// device, not the bare loop device underneath it (the defect this test
    /// guards against: `resolve_backing` silently returning plaintext).
    /// Follows the teacher's `sudo_test_*` naming for root-only tests.
    #[test]
    fn sudo_test_resolve_backing_stacks_crypt_over_loop() {
        let images_dir = tempfile::tempdir().unwrap();
        let image_path = images_dir.path().join("secret.img");
        crate::image::create_empty(&image_path, None, 16).unwrap();

        let dm = DM::new().unwrap();
        let key = SecretHex::new("00".repeat(64).into_bytes());
        let ctx = MountContext {
            images_dir: images_dir.path().to_path_buf(),
            container_uuid: "sudo-test-rb".into(),
            setup_mode: false,
            key: Some(&key),
            dm: Some(&dm),
            mode: VolumeMode::EncryptOnly,
        };
        let mut e = entry(MountType::Device, "secret");
        e.encrypted = true;

        let label = format!("{}-{}", ctx.container_uuid, e.image_name);
        let dev = resolve_backing(&ctx, &e).unwrap();
        assert_eq!(dev, format!("/dev/mapper/{label}"));

        volume::delete_volume(&dm, &label, VolumeMode::EncryptOnly).unwrap();
    }

    #[test]
    fn resolve_backing_rejects_encrypted_entry_without_key() {
        let images_dir = tempfile::tempdir().unwrap();
        let image_path = images_dir.path().join("secret.img");
        crate::image::create_empty(&image_path, None, 16).unwrap();

        let ctx = MountContext {
            images_dir: images_dir.path().to_path_buf(),
            container_uuid: "c0".into(),
            setup_mode: false,
            key: None,
            dm: None,
            mode: VolumeMode::EncryptOnly,
        };
        let mut e = entry(MountType::Device, "secret");
        e.encrypted = true;

        assert!(matches!(resolve_backing(&ctx, &e), Err(CryptvolError::NoKey)));
    }
}

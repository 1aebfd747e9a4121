// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Image provisioner (spec.md 4.5): sparse backing files, copies, and
//! filesystem UUID regeneration.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::debug;

use crate::error::{CryptvolError, Result};

/// Ratio of dm-integrity metadata size to data size for freshly provisioned
/// stacked/standalone integrity images.
const META_FACTOR: f64 = 1.0 / 32.0;

const COPY_CHUNK: usize = 512;

/// Create a sparse file of exactly `bytes` length, forcing allocation of the
/// tail block and zeroing the metadata region dm-integrity will probe.
pub fn create_sparse(path: &Path, bytes: u64) -> Result<()> {
    let f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(crate::error::io_ctx(format!("creating {path:?}")))?;
    f.set_len(bytes).map_err(crate::error::io_ctx(format!("truncating {path:?}")))?;

    if bytes > 0 {
        let mut f2 = &f;
        f2.seek(SeekFrom::Start(bytes - 1)).map_err(crate::error::io_ctx("seeking to tail"))?;
        f2.write_all(&[0u8]).map_err(crate::error::io_ctx("forcing tail allocation"))?;
    }

    let _ = nix::fcntl::fallocate(
        f.as_raw_fd(),
        nix::fcntl::FallocateFlags::FALLOC_FL_ZERO_RANGE,
        0,
        bytes as i64,
    );

    Ok(())
}

/// `create_empty(data_path, meta_path, size_mib)` — sparse data file of
/// `max(size, 10) MiB`, and if `meta_path` is given, a second sparse file
/// sized `data_size * META_FACTOR`.
pub fn create_empty(data_path: &Path, meta_path: Option<&Path>, size_mib: u64) -> Result<()> {
    let size_mib = size_mib.max(10);
    let data_bytes = size_mib * 1024 * 1024;
    create_sparse(data_path, data_bytes)?;
    debug!("created {data_path:?} ({data_bytes} bytes)");

    if let Some(meta) = meta_path {
        let meta_bytes = (data_bytes as f64 * META_FACTOR).ceil() as u64;
        create_sparse(meta, meta_bytes)?;
        debug!("created {meta:?} ({meta_bytes} bytes)");
    }
    Ok(())
}

/// Block-level copy from `src` to `dst`, regenerating the filesystem UUID on
/// btrfs copies to avoid duplicate-UUID kernel rejection.
pub fn create_copy(dst: &Path, src: &Path, fs_type: Option<&str>) -> Result<()> {
    let mut src_f = std::fs::File::open(src).map_err(crate::error::io_ctx(format!("opening {src:?}")))?;
    let mut dst_f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dst)
        .map_err(crate::error::io_ctx(format!("creating {dst:?}")))?;

    let mut buf = [0u8; COPY_CHUNK];
    loop {
        let n = src_f.read(&mut buf).map_err(|e| CryptvolError::CopyFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        dst_f.write_all(&buf[..n]).map_err(|e| CryptvolError::CopyFailed(e.to_string()))?;
    }
    dst_f.sync_all().map_err(|e| CryptvolError::CopyFailed(e.to_string()))?;

    if fs_type == Some("btrfs") {
        regenerate_btrfs_uuid(dst)?;
    }
    Ok(())
}

/// `create_from_device(dst, block_device_path)` — absolute-path guarded copy
/// from a host block device.
pub fn create_from_device(dst: &Path, block_device_path: &Path) -> Result<()> {
    if !block_device_path.is_absolute() {
        return Err(CryptvolError::CopyFailed(format!(
            "refusing relative block device path: {block_device_path:?}"
        )));
    }
    create_copy(dst, block_device_path, None)
}

/// Regenerate a btrfs image's filesystem UUID by invoking `btrfstune -f -u`
/// on it. `btrfstune` is an external filesystem utility (Non-goal); this
/// crate consumes it through its narrow CLI interface rather than
/// reimplementing the btrfs superblock format, matching spec.md 4.5's
/// "avoid duplicate-UUID kernel rejection".
fn regenerate_btrfs_uuid(path: &Path) -> Result<()> {
    let status = std::process::Command::new("btrfstune")
        .arg("-f")
        .arg("-u")
        .arg(path)
        .status()
        .map_err(|e| CryptvolError::UuidRegenFailed(e.to_string()))?;
    if !status.success() {
        return Err(CryptvolError::UuidRegenFailed(format!("btrfstune exited with {status}")));
    }
    Ok(())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! dm-integrity target builder: creates, table-loads, resumes, and removes
//! a `dm-integrity` device, standalone or stacked beneath an AEAD crypt
//! target (spec.md 4.2).

use std::time::Duration;

use log::debug;

use crate::dm::{TargetSpec, DM};
use crate::error::{CryptvolError, Result};
use crate::util::SecretHex;

/// Per-sector authentication tag size, in bytes.
pub const TAG_SIZE: u32 = 32;

/// `open` returns the `/dev/mapper/<label>` path of the resumed device.
///
/// `integrity_key` is `None` exactly when `stacked` is true: authentication
/// is then performed by the AEAD crypt target above, and dm-integrity
/// carries no internal hash of its own.
pub fn open(
    dm: &DM,
    label: &str,
    data_dev: &str,
    meta_dev: &str,
    integrity_key: Option<&SecretHex>,
    sectors: u64,
    stacked: bool,
) -> Result<String> {
    if !stacked && integrity_key.is_none() {
        return Err(CryptvolError::MissingKey);
    }

    let params = if stacked {
        format!("{data_dev} 0 {TAG_SIZE} J 1 meta_device:{meta_dev}")
    } else {
        let key = integrity_key.expect("checked above").as_str();
        format!(
            "{data_dev} 0 {TAG_SIZE} J 3 meta_device:{meta_dev} internal_hash:hmac(sha256):{key} allow_discards"
        )
    };

    dm.create(label)?;
    let target = TargetSpec { sector_start: 0, length: sectors, target_type: "integrity".into(), params };
    dm.load_table(label, &target).map_err(|_| CryptvolError::LoadFailed(label.to_string()))?;
    dm.resume(label).map_err(|_| CryptvolError::ResumeFailed(label.to_string()))?;

    let path = format!("/dev/mapper/{label}");
    crate::dm::wait_for_device(std::path::Path::new(&path), Duration::from_millis(500))?;
    debug!("integrity device ready at {path}");
    Ok(path)
}

/// Tear down an integrity device. Tolerant of the device already being absent.
pub fn close(dm: &DM, label: &str) -> Result<()> {
    match dm.remove(label) {
        Ok(()) => Ok(()),
        Err(CryptvolError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Probe a metadata device's superblock for the `integrt` tag and the
/// `provided_data_sectors` field at offset 16 (spec.md 3, 6).
pub fn probe_provided_sectors(meta_dev: &std::path::Path) -> Result<Option<u64>> {
    use std::io::Read;
    let mut f = std::fs::File::open(meta_dev)
        .map_err(crate::error::io_ctx(format!("opening {meta_dev:?} for superblock probe")))?;
    let mut buf = [0u8; 24];
    match f.read_exact(&mut buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(crate::error::io_ctx("reading integrity superblock")(e)),
    }
    if &buf[0..7] != b"integrt" {
        return Ok(None);
    }
    let sectors = u64::from_le_bytes(buf[16..24].try_into().expect("8 bytes"));
    Ok(Some(sectors))
}

/// True iff the device either has no superblock yet or its recorded sector
/// count disagrees with `intended_sectors` (spec.md 3: first-time-use detection).
pub fn is_first_use(meta_dev: &std::path::Path, intended_sectors: u64) -> Result<bool> {
    Ok(probe_provided_sectors(meta_dev)?.map_or(true, |s| s != intended_sectors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn standalone_params_match_spec_byte_for_byte() {
        let key = SecretHex::new(b"ab".repeat(32));
        let expected = format!(
            "/dev/data 0 32 J 3 meta_device:/dev/meta internal_hash:hmac(sha256):{} allow_discards",
            key.as_str()
        );
        let params = format!(
            "{} 0 {} J 3 meta_device:{} internal_hash:hmac(sha256):{} allow_discards",
            "/dev/data", TAG_SIZE, "/dev/meta", key.as_str()
        );
        assert_eq!(params, expected);
    }

    #[test]
    fn stacked_params_have_no_internal_hash() {
        let params = format!("{} 0 {} J 1 meta_device:{}", "/dev/data", TAG_SIZE, "/dev/meta");
        assert_eq!(params, "/dev/data 0 32 J 1 meta_device:/dev/meta");
    }

    #[test]
    fn probe_reads_tag_and_sector_count() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let mut sb = [0u8; 24];
        sb[0..7].copy_from_slice(b"integrt");
        sb[16..24].copy_from_slice(&123456u64.to_le_bytes());
        f.write_all(&sb).unwrap();
        f.flush().unwrap();
        assert_eq!(probe_provided_sectors(f.path()).unwrap(), Some(123456));
    }

    #[test]
    fn probe_returns_none_without_tag() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 24]).unwrap();
        f.flush().unwrap();
        assert_eq!(probe_provided_sectors(f.path()).unwrap(), None);
    }

    #[test]
    fn first_use_true_on_mismatch_or_absence() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 24]).unwrap();
        f.flush().unwrap();
        assert!(is_first_use(f.path(), 4096).unwrap());
    }
}

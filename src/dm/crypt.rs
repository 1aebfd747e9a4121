// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! dm-crypt target builder: plain XTS or AEAD-fused-with-integrity
//! (spec.md 4.3).

use std::time::Duration;

use log::debug;

use crate::dm::{TargetSpec, DM};
use crate::error::{CryptvolError, Result};
use crate::util::SecretHex;

/// `open` returns the `/dev/mapper/<label>` path of the resumed device.
///
/// `aead` selects `capi:authenc(hmac(sha256),xts(aes))-random`, consuming
/// `integrity:32:aead` from a dm-integrity target stacked directly below
/// `data_dev`; otherwise plain `aes-xts-plain64` is used.
pub fn open(
    dm: &DM,
    label: &str,
    data_dev: &str,
    key: &SecretHex,
    sectors: u64,
    aead: bool,
) -> Result<String> {
    let key_hex = key.as_str();
    let (target_type, params) = if aead {
        (
            "crypt".to_string(),
            format!(
                "capi:authenc(hmac(sha256),xts(aes))-random {key_hex} 0 {data_dev} 0 1 integrity:32:aead"
            ),
        )
    } else {
        ("crypt".to_string(), format!("aes-xts-plain64 {key_hex} 0 {data_dev} 0 1 allow_discards"))
    };

    dm.create(label)?;
    let target = TargetSpec { sector_start: 0, length: sectors, target_type, params };
    dm.load_table(label, &target).map_err(|_| CryptvolError::LoadFailed(label.to_string()))?;
    dm.resume(label).map_err(|_| CryptvolError::ResumeFailed(label.to_string()))?;

    let path = format!("/dev/mapper/{label}");
    crate::dm::wait_for_device(std::path::Path::new(&path), Duration::from_millis(500))?;
    debug!("crypt device ready at {path}");
    Ok(path)
}

/// Tear down a crypt device. Tolerant of the device already being absent.
pub fn close(dm: &DM, label: &str) -> Result<()> {
    match dm.remove(label) {
        Ok(()) => Ok(()),
        Err(CryptvolError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_params_match_spec() {
        let key = SecretHex::new(b"00".repeat(32));
        let params = format!("aes-xts-plain64 {} 0 {} 0 1 allow_discards", key.as_str(), "/dev/mapper/x-integrity");
        assert_eq!(
            params,
            format!("aes-xts-plain64 {} 0 /dev/mapper/x-integrity 0 1 allow_discards", "00".repeat(32))
        );
    }

    #[test]
    fn aead_params_match_spec() {
        let key = SecretHex::new(b"11".repeat(48));
        let params = format!(
            "capi:authenc(hmac(sha256),xts(aes))-random {} 0 {} 0 1 integrity:32:aead",
            key.as_str(),
            "/dev/loop0"
        );
        assert!(params.starts_with("capi:authenc(hmac(sha256),xts(aes))-random "));
        assert!(params.ends_with("0 /dev/loop0 0 1 integrity:32:aead"));
    }
}

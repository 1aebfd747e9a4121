// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mode selection policy (spec.md 4.9): a `not-stacked` marker file in the
//! images directory decides between the modern unstacked layout and the
//! legacy fused `AuthEnc` format.

use std::path::Path;

use log::info;

use crate::error::Result;
use crate::volume::VolumeMode;

const MARKER_NAME: &str = "not-stacked";

/// Select the volume mode for a container whose images live in `images_dir`.
///
/// - marker present → `IntegrityOnly` for the privileged container, else
///   `IntegrityEncrypt`.
/// - marker absent and prior images exist → `AuthEnc` (legacy).
/// - marker absent and no prior images → write the marker and pick as above.
pub fn select_mode(images_dir: &Path, is_privileged: bool) -> Result<VolumeMode> {
    let marker = images_dir.join(MARKER_NAME);

    if marker.exists() {
        return Ok(unstacked_mode(is_privileged));
    }

    if has_prior_images(images_dir)? {
        info!("no {MARKER_NAME} marker but prior images exist under {images_dir:?}: using legacy AuthEnc");
        return Ok(VolumeMode::AuthEnc);
    }

    std::fs::create_dir_all(images_dir).map_err(crate::error::io_ctx(format!("creating {images_dir:?}")))?;
    std::fs::write(&marker, []).map_err(crate::error::io_ctx(format!("writing {marker:?}")))?;
    info!("no prior images under {images_dir:?}: wrote {MARKER_NAME} marker");
    Ok(unstacked_mode(is_privileged))
}

fn unstacked_mode(is_privileged: bool) -> VolumeMode {
    if is_privileged {
        VolumeMode::IntegrityOnly
    } else {
        VolumeMode::IntegrityEncrypt
    }
}

fn has_prior_images(images_dir: &Path) -> Result<bool> {
    if !images_dir.exists() {
        return Ok(false);
    }
    for entry in std::fs::read_dir(images_dir).map_err(crate::error::io_ctx(format!("reading {images_dir:?}")))? {
        let entry = entry.map_err(crate::error::io_ctx("reading dir entry"))?;
        if entry.path().extension().and_then(|e| e.to_str()) == Some("img") {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marker_present_picks_unstacked() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MARKER_NAME), []).unwrap();
        assert_eq!(select_mode(dir.path(), true).unwrap(), VolumeMode::IntegrityOnly);
        assert_eq!(select_mode(dir.path(), false).unwrap(), VolumeMode::IntegrityEncrypt);
    }

    #[test]
    fn no_marker_with_prior_images_is_legacy() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("root.img"), []).unwrap();
        assert_eq!(select_mode(dir.path(), false).unwrap(), VolumeMode::AuthEnc);
        // legacy path must not write a marker behind the caller's back
        assert!(!dir.path().join(MARKER_NAME).exists());
    }

    #[test]
    fn fresh_container_writes_marker_and_picks_unstacked() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("fresh");
        let mode = select_mode(&sub, true).unwrap();
        assert_eq!(mode, VolumeMode::IntegrityOnly);
        assert!(sub.join(MARKER_NAME).exists());
    }
}

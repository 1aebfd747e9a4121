// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Authenticated-encrypted block-volume provisioning and container rootfs
//! composition.
//!
//! `dm` builds and tears down the kernel device-mapper stacks (`dm-integrity`,
//! `dm-crypt`); `volume` is the orchestrator that validates a mode, splits and
//! zeroizes keys, and assembles or rolls back that stack. `image`, `mount`,
//! `overlay`, `rootfs`, and `mode` compose those volumes into a container
//! root: provisioning backing images, mounting declared entries, layering
//! overlays, and performing the final root switch. `tpmctl` is a thin client
//! for the companion TPM control protocol.

pub mod dm;
pub mod error;
pub mod image;
pub mod mode;
pub mod mount;
pub mod overlay;
pub mod rootfs;
pub mod tpmctl;
pub mod util;
pub mod volume;

pub use error::{CryptvolError, Result};

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error taxonomy for the volume-provisioning and root-composition core.

use std::fmt;

/// Result alias used throughout this crate, mirroring the teacher's `DmResult<T>`.
pub type Result<T> = std::result::Result<T, CryptvolError>;

#[derive(Debug)]
pub enum CryptvolError {
    /// Device-mapper mode does not match the key/device arguments given to it.
    InvalidMode(String),
    /// `key_hex` length does not match what the mode requires.
    InvalidKeyLength { expected: usize, got: usize },
    /// Mode requires a metadata device and none was given.
    MissingMetaDevice,
    /// Mode requires a key and none was given.
    MissingKey,
    /// The dm-control device could not be opened.
    TransportError(String),
    /// An ioctl against the dm-control device failed.
    KernelError { op: &'static str, label: String, errno: nix::errno::Errno },
    /// Table-load did not succeed within the retry window.
    LoadFailed(String),
    /// Suspend/resume ioctl failed.
    ResumeFailed(String),
    /// No such device-mapper target; cleanup callers treat this as success.
    NotFound(String),
    /// Loop device could not be bound to a backing file.
    LoopAllocFailed(String),
    /// Loop device could not be released.
    LoopReleaseFailed(String),
    /// A mount(2) call failed.
    MountFailed { target: String, errno: nix::errno::Errno },
    /// mkfs/format helper failed.
    FormatFailed(String),
    /// Block-level copy between images failed.
    CopyFailed(String),
    /// Filesystem UUID regeneration failed.
    UuidRegenFailed(String),
    /// Encryption requested but no key is available for this container.
    NoKey,
    /// Generic I/O error with context.
    Io(String, std::io::Error),
}

impl fmt::Display for CryptvolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptvolError::InvalidMode(m) => write!(f, "invalid volume mode: {m}"),
            CryptvolError::InvalidKeyLength { expected, got } => {
                write!(f, "invalid key length: expected {expected} hex chars, got {got}")
            }
            CryptvolError::MissingMetaDevice => write!(f, "mode requires a metadata device"),
            CryptvolError::MissingKey => write!(f, "mode requires a key"),
            CryptvolError::TransportError(e) => write!(f, "could not open dm-control: {e}"),
            CryptvolError::KernelError { op, label, errno } => {
                write!(f, "dm ioctl {op} on {label} failed: {errno}")
            }
            CryptvolError::LoadFailed(label) => write!(f, "table_load exhausted retries for {label}"),
            CryptvolError::ResumeFailed(label) => write!(f, "suspend/resume failed for {label}"),
            CryptvolError::NotFound(label) => write!(f, "no such dm device: {label}"),
            CryptvolError::LoopAllocFailed(p) => write!(f, "could not bind loop device to {p}"),
            CryptvolError::LoopReleaseFailed(p) => write!(f, "could not release loop device for {p}"),
            CryptvolError::MountFailed { target, errno } => {
                write!(f, "mount of {target} failed: {errno}")
            }
            CryptvolError::FormatFailed(e) => write!(f, "format failed: {e}"),
            CryptvolError::CopyFailed(e) => write!(f, "image copy failed: {e}"),
            CryptvolError::UuidRegenFailed(e) => write!(f, "uuid regeneration failed: {e}"),
            CryptvolError::NoKey => write!(f, "encrypted mount entry but container has no key"),
            CryptvolError::Io(ctx, e) => write!(f, "{ctx}: {e}"),
        }
    }
}

impl std::error::Error for CryptvolError {}

impl From<nix::errno::Errno> for CryptvolError {
    fn from(e: nix::errno::Errno) -> Self {
        CryptvolError::KernelError { op: "ioctl", label: String::new(), errno: e }
    }
}

/// Attach file/operation context to an `io::Error`, matching the teacher's habit of
/// converting `std::io::Error` into its own taxonomy rather than propagating it raw.
pub fn io_ctx(ctx: impl Into<String>) -> impl FnOnce(std::io::Error) -> CryptvolError {
    move |e| CryptvolError::Io(ctx.into(), e)
}

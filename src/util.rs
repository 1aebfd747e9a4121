// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Small building blocks shared by the dm-ioctl transport and the orchestrator:
//! alignment arithmetic and zeroizing key storage.

use std::fmt;

/// Round `len` up to the next multiple of `align`.
pub fn align_to(len: usize, align: usize) -> usize {
    (len + align - 1) / align * align
}

/// ASCII-hex key material that zeroes its backing storage on drop and never
/// appears in `Debug`/`Display` output or in error payloads.
pub struct SecretHex(Vec<u8>);

impl SecretHex {
    pub fn new(hex: impl Into<Vec<u8>>) -> Self {
        SecretHex(hex.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        // Validated ASCII-hex at construction sites (volume::validate_key_len).
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    /// Split into two secrets of the given lengths. `a_len + b_len` must equal `len()`.
    pub fn split_at(&self, a_len: usize, b_len: usize) -> (SecretHex, SecretHex) {
        debug_assert_eq!(a_len + b_len, self.0.len());
        (
            SecretHex(self.0[..a_len].to_vec()),
            SecretHex(self.0[a_len..a_len + b_len].to_vec()),
        )
    }
}

impl Drop for SecretHex {
    fn drop(&mut self) {
        // A plain `for b in iter_mut { *b = 0 }` can be elided by the optimizer since
        // nothing observes the write afterward; go through a volatile write instead.
        for b in self.0.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

impl fmt::Debug for SecretHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHex({} bytes, redacted)", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(8, 8), 8);
        assert_eq!(align_to(9, 8), 16);
        assert_eq!(align_to(0, 8), 0);
    }

    #[test]
    fn split_preserves_bytes() {
        let s = SecretHex::new(b"aabbccdd".to_vec());
        let (a, b) = s.split_at(4, 4);
        assert_eq!(a.as_str(), "aabb");
        assert_eq!(b.as_str(), "ccdd");
    }

    #[test]
    fn debug_never_prints_bytes() {
        let s = SecretHex::new(b"deadbeef".to_vec());
        let rendered = format!("{s:?}");
        assert!(!rendered.contains("deadbeef"));
    }
}

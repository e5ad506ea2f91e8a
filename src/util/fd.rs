//! File descriptor ownership helpers.
//!
//! Sync-file descriptors use `-1` as a real protocol value ("already
//! signaled"), so the usual `OwnedFd` cannot represent every state a fence
//! slot can be in. `SyncFd` owns one descriptor slot where `-1` is valid.

use std::os::unix::io::RawFd;

/// An owned sync-file descriptor slot.
///
/// Holds either a real descriptor (closed on drop) or `-1`, which encodes a
/// fence that is already signaled. Exactly one `SyncFd` owns a given
/// descriptor value at a time; duplication goes through [`SyncFd::dup_raw`].
#[derive(Debug)]
pub struct SyncFd(RawFd);

impl SyncFd {
    /// The "already signaled" sentinel.
    pub const SIGNALED: RawFd = -1;

    /// Takes ownership of `fd`. Negative values are normalized to `-1`.
    pub fn from_raw(fd: RawFd) -> Self {
        Self(if fd < 0 { Self::SIGNALED } else { fd })
    }

    /// A slot holding the pre-signaled sentinel.
    pub fn signaled() -> Self {
        Self(Self::SIGNALED)
    }

    /// Duplicates `fd` into a new slot. `dup(2)` on `-1` (or any failure)
    /// yields the signaled sentinel, which is what callers ferrying a
    /// possibly-absent fence want.
    pub fn dup_raw(fd: RawFd) -> Self {
        if fd < 0 {
            return Self::signaled();
        }
        let dup = unsafe { libc::dup(fd) };
        Self::from_raw(dup)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    pub fn is_signaled(&self) -> bool {
        self.0 == Self::SIGNALED
    }

    /// Moves the descriptor out, leaving the signaled sentinel behind.
    /// The caller becomes responsible for closing the returned value.
    pub fn take(&mut self) -> RawFd {
        std::mem::replace(&mut self.0, Self::SIGNALED)
    }

    /// Replaces the held descriptor, closing the previous one.
    pub fn replace(&mut self, other: SyncFd) {
        *self = other;
    }
}

impl Drop for SyncFd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe { libc::close(self.0) };
        }
    }
}

/// Closes a raw descriptor, ignoring `-1` and errors.
pub fn close_raw(fd: RawFd) {
    if fd >= 0 {
        unsafe { libc::close(fd) };
    }
}

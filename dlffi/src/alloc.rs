//! Native (malloc-backed) buffers.
//!
//! Every buffer the engine allocates on behalf of a call goes through
//! here so a per-thread counter can tell whether a call path leaked.

use std::cell::Cell;
use std::ffi::c_void;
use std::ptr::NonNull;

use crate::error::{FfiError, Result};

thread_local! {
    static LIVE_BUFFERS: Cell<isize> = const { Cell::new(0) };
}

/// Number of [`NativeBuffer`]s currently alive on this thread.
pub fn live_allocations() -> isize {
    LIVE_BUFFERS.with(|n| n.get())
}

fn track(delta: isize) {
    LIVE_BUFFERS.with(|n| n.set(n.get() + delta));
}

/// A zero-initialised block from the C allocator, freed on drop.
///
/// malloc's alignment covers every scalar libffi passes by reference,
/// so argument and return slots can live here directly.
pub struct NativeBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

impl NativeBuffer {
    pub fn zeroed(len: usize) -> Result<Self> {
        // SAFETY: calloc with a non-zero size; null is checked below.
        let raw = unsafe { libc::calloc(1, len.max(1)) } as *mut u8;
        let ptr = NonNull::new(raw)
            .ok_or(FfiError::AllocationFailure { size: len })?;
        track(1);
        Ok(Self { ptr, len })
    }

    /// Copies `bytes` and appends a NUL terminator.
    pub fn c_string(bytes: &[u8]) -> Result<Self> {
        let buf = Self::zeroed(bytes.len() + 1)?;
        // SAFETY: the buffer holds len + 1 bytes, the last stays zero.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                buf.as_mut_ptr(),
                bytes.len(),
            );
        }
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_void_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr() as *mut c_void
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len initialised bytes.
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
        }
    }

    pub fn fill_zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Hands the block to the caller; it must eventually be released
    /// with `libc::free`.
    pub fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        track(-1);
        ptr
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        // SAFETY: the block came from calloc and is freed exactly once.
        unsafe { libc::free(self.ptr.as_ptr() as *mut c_void) };
        track(-1);
    }
}

/// NUL-terminated copy of a script string handed to native code.
pub type TextBuffer = NativeBuffer;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_follows_buffer_lifetimes() {
        let base = live_allocations();
        let a = NativeBuffer::zeroed(16).expect("alloc");
        let b = NativeBuffer::c_string(b"hi").expect("alloc");
        assert_eq!(live_allocations(), base + 2);
        assert_eq!(b.as_slice(), b"hi\0");
        assert!(a.as_slice().iter().all(|&x| x == 0));
        drop(a);
        let raw = b.into_raw();
        assert_eq!(live_allocations(), base);
        unsafe { libc::free(raw as *mut c_void) };
    }

    #[test]
    fn zero_sized_requests_still_get_a_block() {
        let buf = NativeBuffer::zeroed(0).expect("alloc");
        assert!(buf.is_empty());
        assert!(!buf.as_ptr().is_null());
    }
}

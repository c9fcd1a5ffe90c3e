//! Executable code buffers.
//!
//! Generated machine code is copied into a fresh anonymous mapping which is
//! then flipped to PROT_READ|PROT_EXEC exactly once. After that transition
//! the buffer is immutable — no writer ever touches it again — which is what
//! makes lock-free concurrent invocation sound.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

static LIVE_BUFFERS: AtomicUsize = AtomicUsize::new(0);

/// Number of executable buffers currently mapped in this process. Exposed so
/// tests can observe that dropping descriptors releases the code memory.
pub fn live_buffer_count() -> usize {
    LIVE_BUFFERS.load(Ordering::SeqCst)
}

/// An executable memory region holding one generated kernel.
pub struct CodeBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: CodeBuffer owns its mapping exclusively. After construction the
// region is PROT_READ|PROT_EXEC and never written, so sharing references
// across threads is sound.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Allocate an executable region and copy `code` into it.
    pub fn new(code: &[u8]) -> Result<Self> {
        if code.is_empty() {
            return Err(Error::Assembly("no code was emitted".into()));
        }

        let page = page_size();
        let len = (code.len() + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping, no fd; result checked against
        // MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::CodeBuffer("mmap failed".into()));
        }
        let ptr = ptr as *mut u8;

        // SAFETY: the mapping is at least code.len() bytes and writable.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        // One-way transition to execute-only; the region is never writable
        // again for the life of the buffer.
        let rc = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if rc != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(Error::CodeBuffer("mprotect failed".into()));
        }

        LIVE_BUFFERS.fetch_add(1, Ordering::SeqCst);
        Ok(CodeBuffer { ptr, len })
    }

    /// Entry point of the generated code.
    pub fn entry(&self) -> *const u8 {
        self.ptr
    }

    /// Mapped size in bytes (page-rounded).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
            LIVE_BUFFERS.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

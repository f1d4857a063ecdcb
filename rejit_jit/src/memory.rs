//! Executable memory for compiled matchers.
//!
//! [`ExecBuf`] owns one private, page-aligned mapping per compiled
//! pattern and walks it through a one-way W^X lifecycle: mapped
//! read-write, filled and patched by the assembler, then flipped to
//! read+execute exactly once before a function pointer ever escapes.
//! There is no path back to writable; recompiling means a fresh
//! buffer. Dropping the buffer releases the mapping and invalidates
//! any outstanding function pointer.
//!
//! Syscall failures surface as [`std::io::Error`] (errno on unix,
//! `GetLastError` on windows) so the compile pipeline can report why a
//! mapping was refused instead of a bare "allocation failed".
//!
//! # Safety
//! Handing out pointers into code that was just written is inherently
//! unsafe; the safe surface here stops at [`ExecBuf::as_fn`], whose
//! caller vouches for the signature.

use std::io;
use std::ptr::NonNull;

/// Mapping granularity; requested capacities round up to this.
pub const PAGE_SIZE: usize = 4096;

/// Thin shims over the platform's virtual-memory calls. Every mapping
/// made here is private and starts read-write; `protect_exec` is the
/// single permission transition an [`ExecBuf`] ever makes.
mod sys {
    use std::io;
    use std::ptr::NonNull;

    /// Map `size` bytes read-write.
    #[cfg(unix)]
    pub fn map_rw(size: usize) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    }

    /// Map `size` bytes read-write.
    #[cfg(windows)]
    pub fn map_rw(size: usize) -> io::Result<NonNull<u8>> {
        use windows_sys::Win32::System::Memory::{
            MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
        };

        let ptr = unsafe {
            VirtualAlloc(std::ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
        };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
    }

    /// Exchange write permission for execute permission.
    #[cfg(unix)]
    pub fn protect_exec(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        let rc = unsafe {
            libc::mprotect(
                ptr.as_ptr().cast(),
                size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Exchange write permission for execute permission.
    #[cfg(windows)]
    pub fn protect_exec(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READ, VirtualProtect};

        let mut old_protect = 0;
        let rc = unsafe { VirtualProtect(ptr.as_ptr().cast(), size, PAGE_EXECUTE_READ, &mut old_protect) };
        if rc != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Release a mapping.
    ///
    /// # Safety
    /// `ptr`/`size` must describe a live mapping from [`map_rw`], and
    /// nothing may touch it afterwards.
    #[cfg(unix)]
    pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
        unsafe {
            libc::munmap(ptr.as_ptr().cast(), size);
        }
    }

    /// Release a mapping.
    ///
    /// # Safety
    /// `ptr` must be a live mapping from [`map_rw`], and nothing may
    /// touch it afterwards.
    #[cfg(windows)]
    pub unsafe fn unmap(ptr: NonNull<u8>, _size: usize) {
        use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

        unsafe {
            VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
        }
    }
}

// =============================================================================
// Executable Buffer
// =============================================================================

/// A page-aligned buffer holding one compiled matcher.
///
/// Created writable, filled and patched by the assembler, then sealed
/// with [`ExecBuf::make_executable`]. The write/patch methods refuse a
/// sealed buffer and the seal is permanent.
#[derive(Debug)]
pub struct ExecBuf {
    /// Start of the mapping.
    ptr: NonNull<u8>,
    /// Total mapped size (page-aligned).
    capacity: usize,
    /// Bytes written.
    len: usize,
    /// Whether the mapping has been sealed read+execute.
    is_executable: bool,
}

impl ExecBuf {
    /// Map a writable buffer of at least `min_capacity` bytes, rounded
    /// up to the page boundary.
    pub fn new(min_capacity: usize) -> io::Result<Self> {
        let capacity = Self::align_to_page(min_capacity.max(PAGE_SIZE));
        let ptr = sys::map_rw(capacity)?;

        Ok(ExecBuf {
            ptr,
            capacity,
            len: 0,
            is_executable: false,
        })
    }

    /// Get the number of code bytes written.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no code has been written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if the buffer has been sealed.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Get a pointer to the start of the code.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get the written bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Append bytes to the buffer.
    ///
    /// # Panics
    /// Panics if the buffer is sealed or the bytes do not fit; the
    /// assembler sizes the buffer before writing.
    pub fn write(&mut self, bytes: &[u8]) {
        assert!(!self.is_executable, "cannot write to sealed buffer");
        assert!(self.len + bytes.len() <= self.capacity, "buffer overflow");

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
    }

    /// Patch a little-endian u64 at a specific offset.
    ///
    /// # Panics
    /// Panics if the buffer is sealed or the offset is out of bounds.
    pub fn patch_u64(&mut self, offset: usize, val: u64) {
        assert!(!self.is_executable, "cannot patch sealed buffer");
        assert!(offset + 8 <= self.len, "patch out of bounds");

        unsafe {
            std::ptr::copy_nonoverlapping(
                val.to_le_bytes().as_ptr(),
                self.ptr.as_ptr().add(offset),
                8,
            );
        }
    }

    /// Seal the mapping read+execute. Idempotent; on failure the
    /// buffer stays writable and unsealed.
    pub fn make_executable(&mut self) -> io::Result<()> {
        if self.is_executable {
            return Ok(());
        }

        sys::protect_exec(self.ptr, self.capacity)?;
        self.is_executable = true;
        Ok(())
    }

    /// Get a function pointer to the start of the buffer.
    ///
    /// # Safety
    /// - The buffer must be sealed executable.
    /// - The code must be valid for the signature `F`.
    #[inline]
    pub unsafe fn as_fn<F>(&self) -> F
    where
        F: Copy,
    {
        debug_assert!(self.is_executable, "buffer must be executable");
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const ()>(),
            "F must be a function pointer"
        );
        unsafe { std::mem::transmute_copy(&self.ptr.as_ptr()) }
    }

    /// Align a size up to the nearest page boundary.
    #[inline]
    const fn align_to_page(size: usize) -> usize {
        (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }
}

impl Drop for ExecBuf {
    fn drop(&mut self) {
        unsafe {
            sys::unmap(self.ptr, self.capacity);
        }
    }
}

// The mapping is exclusively owned and, once sealed, immutable;
// concurrent invocation of the emitted function is read-only.
unsafe impl Send for ExecBuf {}
unsafe impl Sync for ExecBuf {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_buf_creation() {
        let buf = ExecBuf::new(1024).expect("failed to map");
        assert!(buf.capacity() >= 1024);
        assert_eq!(buf.capacity() % PAGE_SIZE, 0);
        assert_eq!(buf.len(), 0);
        assert!(buf.is_empty());
        assert!(!buf.is_executable());
    }

    #[test]
    fn test_exec_buf_write() {
        let mut buf = ExecBuf::new(64).expect("failed to map");
        buf.write(&[0x90, 0xC3]);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.as_slice(), &[0x90, 0xC3]);
    }

    #[test]
    fn test_exec_buf_patch() {
        let mut buf = ExecBuf::new(64).expect("failed to map");
        buf.write(&[0; 12]);
        buf.patch_u64(2, 0x1122_3344_5566_7788);
        assert_eq!(&buf.as_slice()[2..10], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn test_exec_buf_seal() {
        let mut buf = ExecBuf::new(64).expect("failed to map");
        buf.write(&[0xC3]);
        buf.make_executable().expect("failed to seal");
        assert!(buf.is_executable());
        // Idempotent.
        buf.make_executable().expect("second seal should be a no-op");
    }

    #[test]
    fn test_page_alignment() {
        assert_eq!(ExecBuf::align_to_page(1), PAGE_SIZE);
        assert_eq!(ExecBuf::align_to_page(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(ExecBuf::align_to_page(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_exec_buf_execute() {
        let mut buf = ExecBuf::new(64).expect("failed to map");

        // mov eax, 42; ret
        buf.write(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
        buf.make_executable().expect("failed to seal");

        type FortyTwo = unsafe extern "C" fn() -> i32;
        let f: FortyTwo = unsafe { buf.as_fn() };
        assert_eq!(unsafe { f() }, 42);
    }
}

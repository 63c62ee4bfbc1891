//! Guest linear memory
//!
//! Bounds-checked translation of guest addresses into host slices. The
//! backing buffer is reserved at its maximum size up front, so growth only
//! moves the accessible bound and never relocates the base. Multi-byte
//! accesses are little-endian to match the sandbox ABI.
//!
//! Returned slices must not be retained across any call that may grow or
//! unmap memory. All threads of a local OMP team share one memory; the
//! runtime offers no data-race protection between them, the guest is
//! responsible for its own synchronisation.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::error::{Trap, TrapResult};

/// Size of one guest page (the WebAssembly page size)
pub const WASM_PAGE_SIZE: usize = 65536;

/// One guest module's linear memory
pub struct GuestMemory {
    /// Backing buffer, allocated at `max_pages` and never moved
    data: UnsafeCell<Box<[u8]>>,
    /// Current accessible size in bytes (always a whole number of pages)
    size_bytes: AtomicUsize,
    /// Hard page limit for this module
    max_pages: u32,
    /// Serialises growth; readers only need the atomic bound
    grow_lock: Mutex<()>,
}

// The buffer itself never moves; the guest owns cross-thread ordering.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    pub fn new(initial_pages: u32, max_pages: u32) -> Self {
        let max_pages = max_pages.max(initial_pages);
        let data = vec![0u8; max_pages as usize * WASM_PAGE_SIZE].into_boxed_slice();
        Self {
            data: UnsafeCell::new(data),
            size_bytes: AtomicUsize::new(initial_pages as usize * WASM_PAGE_SIZE),
            max_pages,
            grow_lock: Mutex::new(()),
        }
    }

    /// Current accessible size in bytes
    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Acquire)
    }

    /// Current accessible size in pages
    pub fn num_pages(&self) -> u32 {
        (self.size_bytes() / WASM_PAGE_SIZE) as u32
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Validate `addr + len` against the current size, returning the host
    /// offset of `addr`.
    fn check(&self, addr: u32, len: u32) -> TrapResult<usize> {
        let size = self.size_bytes();
        let end = addr as u64 + len as u64;
        if end > size as u64 {
            return Err(Trap::GuestBounds {
                addr,
                len,
                memory_size: size as u32,
            });
        }
        Ok(addr as usize)
    }

    /// Host view of `len` bytes of guest memory at `addr`
    pub fn slice(&self, addr: u32, len: u32) -> TrapResult<&[u8]> {
        let start = self.check(addr, len)?;
        // Bound was checked above; the base never moves.
        unsafe {
            let base = (*self.data.get()).as_ptr();
            Ok(std::slice::from_raw_parts(base.add(start), len as usize))
        }
    }

    /// Mutable host view of `len` bytes of guest memory at `addr`
    ///
    /// Overlapping views handed to concurrent team threads are the guest's
    /// problem, exactly as they would be inside the sandbox.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, addr: u32, len: u32) -> TrapResult<&mut [u8]> {
        let start = self.check(addr, len)?;
        unsafe {
            let base = (*self.data.get()).as_mut_ptr();
            Ok(std::slice::from_raw_parts_mut(base.add(start), len as usize))
        }
    }

    pub fn read_u32(&self, addr: u32) -> TrapResult<u32> {
        let bytes = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn write_u32(&self, addr: u32, value: u32) -> TrapResult<()> {
        self.slice_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_i32(&self, addr: u32) -> TrapResult<i32> {
        self.read_u32(addr).map(|v| v as i32)
    }

    pub fn write_i32(&self, addr: u32, value: i32) -> TrapResult<()> {
        self.write_u32(addr, value as u32)
    }

    pub fn read_i16(&self, addr: u32) -> TrapResult<i16> {
        let bytes = self.slice(addr, 2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn write_i16(&self, addr: u32, value: i16) -> TrapResult<()> {
        self.slice_mut(addr, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read `count` consecutive little-endian u32 values (e.g. a guest
    /// pointer array)
    pub fn read_u32_vec(&self, addr: u32, count: u32) -> TrapResult<Vec<u32>> {
        let len = count.checked_mul(4).ok_or(Trap::GuestBounds {
            addr,
            len: u32::MAX,
            memory_size: self.size_bytes() as u32,
        })?;
        let bytes = self.slice(addr, len)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Read a NUL-terminated guest string starting at `addr`
    pub fn read_c_string(&self, addr: u32) -> TrapResult<String> {
        let size = self.size_bytes() as u32;
        if addr >= size {
            return Err(Trap::GuestBounds {
                addr,
                len: 1,
                memory_size: size,
            });
        }
        let bytes = self.slice(addr, size - addr)?;
        match bytes.iter().position(|&b| b == 0) {
            Some(nul) => Ok(String::from_utf8_lossy(&bytes[..nul]).into_owned()),
            None => Err(Trap::GuestBounds {
                addr,
                len: size - addr,
                memory_size: size,
            }),
        }
    }

    /// Grow the accessible region by `pages`, returning the base page index
    /// of the new region.
    pub fn grow(&self, pages: u32) -> TrapResult<u32> {
        let _guard = self.grow_lock.lock().unwrap();
        let current = self.size_bytes.load(Ordering::Acquire);
        let current_pages = (current / WASM_PAGE_SIZE) as u32;
        let target = current_pages as u64 + pages as u64;
        if target > self.max_pages as u64 {
            return Err(Trap::OutOfMemory {
                requested_pages: pages,
                max_pages: self.max_pages,
            });
        }
        self.size_bytes
            .store(target as usize * WASM_PAGE_SIZE, Ordering::Release);
        Ok(current_pages)
    }

    /// Unmap `pages` pages starting at `base_page`. The pages are zeroed;
    /// the break is unchanged (address validity depends only on the current
    /// size) and growth is never rolled back.
    pub fn unmap(&self, base_page: u32, pages: u32) -> TrapResult<()> {
        let addr = base_page as u64 * WASM_PAGE_SIZE as u64;
        let len = pages as u64 * WASM_PAGE_SIZE as u64;
        if addr + len > self.size_bytes() as u64 {
            return Err(Trap::GuestBounds {
                addr: addr as u32,
                len: len as u32,
                memory_size: self.size_bytes() as u32,
            });
        }
        let region = self.slice_mut(addr as u32, len as u32)?;
        region.fill(0);
        Ok(())
    }

    /// Copy of the currently accessible region
    pub fn snapshot(&self) -> Vec<u8> {
        // Unwrap is fine: zero-length slice of a live buffer cannot fail.
        self.slice(0, self.size_bytes() as u32)
            .map(|s| s.to_vec())
            .unwrap_or_default()
    }

    /// Overwrite the front of memory with a snapshot, growing first if the
    /// snapshot is larger than the current size.
    pub fn restore(&self, snapshot: &[u8]) -> TrapResult<()> {
        let needed_pages = snapshot.len().div_ceil(WASM_PAGE_SIZE) as u32;
        let current_pages = self.num_pages();
        if needed_pages > current_pages {
            self.grow(needed_pages - current_pages)?;
        }
        self.slice_mut(0, snapshot.len() as u32)?
            .copy_from_slice(snapshot);
        Ok(())
    }
}

impl std::fmt::Debug for GuestMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestMemory")
            .field("size_bytes", &self.size_bytes())
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_check() {
        let mem = GuestMemory::new(1, 4);
        assert!(mem.slice(0, WASM_PAGE_SIZE as u32).is_ok());
        let err = mem.slice(WASM_PAGE_SIZE as u32 - 2, 4).unwrap_err();
        assert!(matches!(err, Trap::GuestBounds { .. }));
    }

    #[test]
    fn test_u32_roundtrip_little_endian() {
        let mem = GuestMemory::new(1, 1);
        mem.write_u32(16, 0xDEAD_BEEF).unwrap();
        assert_eq!(mem.read_u32(16).unwrap(), 0xDEAD_BEEF);
        // LE byte order on the wire
        assert_eq!(mem.slice(16, 4).unwrap(), &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_grow_extends_bounds() {
        let mem = GuestMemory::new(2, 8);
        let old_size = mem.size_bytes() as u32;
        assert!(mem.slice(old_size, 1).is_err());

        let base = mem.grow(3).unwrap();
        assert_eq!(base, 2);
        assert_eq!(mem.num_pages(), 5);
        // Any access into the new region is now valid
        assert!(mem.slice(old_size, 3 * WASM_PAGE_SIZE as u32).is_ok());
    }

    #[test]
    fn test_grow_past_max_fails() {
        let mem = GuestMemory::new(1, 2);
        let err = mem.grow(5).unwrap_err();
        assert!(matches!(err, Trap::OutOfMemory { .. }));
        assert_eq!(mem.num_pages(), 1);
    }

    #[test]
    fn test_unmap_zeroes() {
        let mem = GuestMemory::new(2, 2);
        mem.write_u32(WASM_PAGE_SIZE as u32, 42).unwrap();
        mem.unmap(1, 1).unwrap();
        assert_eq!(mem.read_u32(WASM_PAGE_SIZE as u32).unwrap(), 0);
        // Break unchanged
        assert_eq!(mem.num_pages(), 2);
    }

    #[test]
    fn test_c_string() {
        let mem = GuestMemory::new(1, 1);
        mem.slice_mut(100, 10).unwrap()[..10].copy_from_slice(b"/etc/host\0");
        assert_eq!(mem.read_c_string(100).unwrap(), "/etc/host");
    }

    #[test]
    fn test_snapshot_restore() {
        let mem = GuestMemory::new(1, 4);
        mem.write_u32(8, 123).unwrap();
        let snap = mem.snapshot();

        let other = GuestMemory::new(1, 4);
        other.restore(&snap).unwrap();
        assert_eq!(other.read_u32(8).unwrap(), 123);
    }
}

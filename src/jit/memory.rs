//! Pooled, page-aligned executable memory, enforcing write-xor-execute: a
//! block is writable while code is being copied in, then flipped to
//! executable-only before any caller can invoke it, and never both at once.
//!
//! Grounded on `raya_engine::jit::runtime::code_cache::CodeCache`'s
//! `parking_lot::RwLock`-guarded shared-state shape (texture reference; that
//! type caches compiled code by key, this one pools raw pages) and on
//! `ExecutableCode`'s `unsafe impl Send/Sync` over a raw pointer, which this
//! module's `ExecBlock` mirrors for the same reason: the pointer is a plain
//! address with no interior mutability, so sharing it across threads is
//! sound as long as callers respect W^X ordering.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CodegenError, CodegenResult};

fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf with _SC_PAGESIZE has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            return size as usize;
        }
    }
    4096
}

fn round_up_to_page(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size) * page_size
}

/// One `mmap`-backed mapping, shared by every `ExecBlock` bump-allocated out
/// of it. Unmapped once the last `ExecBlock` referencing it is dropped.
struct RawMapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: `ptr` is a plain mapped address; sub-ranges are page-disjoint, so
// concurrent mprotect/write calls on distinct `ExecBlock`s never race.
unsafe impl Send for RawMapping {}
unsafe impl Sync for RawMapping {}

impl Drop for RawMapping {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: ptr/len describe a mapping this module created with mmap.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

/// A page-aligned sub-range of a shared `RawMapping`. While `writable` is
/// true, its pages are `PROT_READ | PROT_WRITE`; once flipped,
/// `PROT_READ | PROT_EXEC`. The two states are never combined, and a block
/// cannot be read back to `writable` once flipped (the pool bump-allocates a
/// fresh sub-range instead of reusing a flipped one for new code).
pub struct ExecBlock {
    mapping: Arc<RawMapping>,
    offset: usize,
    len: usize,
    writable: bool,
}

impl ExecBlock {
    fn ptr(&self) -> *mut u8 {
        // SAFETY: offset + len never exceeds mapping.len (enforced by the
        // pool at allocation time).
        unsafe { self.mapping.ptr.add(self.offset) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_executable(&self) -> bool {
        !self.writable
    }

    /// Copies `code` into the block. Only valid while still writable.
    pub fn write(&mut self, code: &[u8]) -> CodegenResult<()> {
        if !self.writable {
            return Err(CodegenError::PermissionFlipFailed(
                "attempted to write into a block already flipped executable".into(),
            ));
        }
        if code.len() > self.len {
            return Err(CodegenError::AllocationFailed { requested: code.len() });
        }
        // SAFETY: ptr() is valid for `len` writable bytes, code.len() <= len.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.ptr(), code.len());
        }
        Ok(())
    }

    /// Flips the block from writable to executable-only. After this call the
    /// block's address may be cast to a function pointer and invoked.
    pub fn make_executable(&mut self) -> CodegenResult<()> {
        if !self.writable {
            return Ok(());
        }
        #[cfg(unix)]
        {
            // SAFETY: ptr()/len describe a page-aligned sub-range of a
            // mapping previously created by this module with
            // PROT_READ|PROT_WRITE; the range is disjoint from every other
            // live `ExecBlock`'s range.
            let result = unsafe { libc::mprotect(self.ptr() as *mut libc::c_void, self.len, libc::PROT_READ | libc::PROT_EXEC) };
            if result != 0 {
                return Err(CodegenError::PermissionFlipFailed(std::io::Error::last_os_error().to_string()));
            }
        }
        self.writable = false;
        Ok(())
    }
}

/// Allocates and tracks executable memory, bump-allocating sub-regions out of
/// shared OS mappings instead of calling `mmap` on every request: a new
/// mapping is only created when no existing one has enough room left, sized
/// `max(default_block_size, alignUp(size, pageSize))`.
pub struct ExecMemoryPool {
    inner: Mutex<PoolState>,
}

struct Mapping {
    raw: Arc<RawMapping>,
    used: usize,
}

struct PoolState {
    page_size: usize,
    default_block_size: usize,
    total_allocated: usize,
    mappings: Vec<Mapping>,
}

impl ExecMemoryPool {
    pub fn new() -> Self {
        Self::with_config(&crate::jit::Config::default())
    }

    pub fn with_config(config: &crate::jit::Config) -> Self {
        let page_size = config.page_size_override.unwrap_or_else(page_size);
        Self {
            inner: Mutex::new(PoolState {
                page_size,
                default_block_size: round_up_to_page(config.default_block_size.max(1), page_size),
                total_allocated: 0,
                mappings: Vec::new(),
            }),
        }
    }

    pub fn total_allocated(&self) -> usize {
        self.inner.lock().total_allocated
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Finds a mapping with at least `size` bytes free and bump-allocates a
    /// sub-range from it; otherwise maps a fresh block sized
    /// `max(default_block_size, alignUp(size, pageSize))` and allocates from
    /// that. The returned block is page-aligned within its mapping and
    /// initially writable.
    pub fn allocate(&self, size: usize) -> CodegenResult<ExecBlock> {
        let mut state = self.inner.lock();
        let needed = round_up_to_page(size.max(1), state.page_size);

        if let Some(mapping) = state.mappings.iter_mut().find(|m| m.raw.len - m.used >= needed) {
            let offset = mapping.used;
            mapping.used += needed;
            let raw = Arc::clone(&mapping.raw);
            return Ok(ExecBlock {
                mapping: raw,
                offset,
                len: needed,
                writable: true,
            });
        }

        let mapped_len = needed.max(state.default_block_size);

        #[cfg(unix)]
        let ptr = {
            // SAFETY: a fixed-size anonymous private mapping request; no
            // preconditions beyond a valid length, which mapped_len is.
            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    mapped_len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(CodegenError::AllocationFailed { requested: mapped_len });
            }
            raw as *mut u8
        };
        #[cfg(not(unix))]
        let ptr: *mut u8 = {
            return Err(CodegenError::AllocationFailed { requested: mapped_len });
        };

        state.total_allocated += mapped_len;
        let raw = Arc::new(RawMapping { ptr, len: mapped_len });
        state.mappings.push(Mapping {
            raw: Arc::clone(&raw),
            used: needed,
        });

        Ok(ExecBlock {
            mapping: raw,
            offset: 0,
            len: needed,
            writable: true,
        })
    }
}

impl Default for ExecMemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_up_to_a_full_page() {
        let pool = ExecMemoryPool::new();
        let block = pool.allocate(1).unwrap();
        assert!(block.len() >= 1);
        assert_eq!(block.len() % page_size(), 0);
    }

    #[test]
    fn write_then_flip_then_reject_further_writes() {
        let pool = ExecMemoryPool::new();
        let mut block = pool.allocate(16).unwrap();
        block.write(&[0xC3]).unwrap();
        block.make_executable().unwrap();
        assert!(block.is_executable());
        assert!(block.write(&[0x90]).is_err());
    }

    #[test]
    fn small_allocations_share_a_pooled_block() {
        let pool = ExecMemoryPool::new();
        let a = pool.allocate(16).unwrap();
        let b = pool.allocate(16).unwrap();
        assert_eq!(pool.block_count(), 1);
        let addr_a = a.as_ptr() as usize;
        let addr_b = b.as_ptr() as usize;
        let config = crate::jit::Config::default();
        assert!(addr_a.abs_diff(addr_b) < config.default_block_size.max(page_size()));
    }

    #[test]
    fn a_block_larger_than_the_default_gets_its_own_mapping() {
        let mut config = crate::jit::Config::default();
        config.default_block_size = page_size();
        let pool = ExecMemoryPool::with_config(&config);
        let big = pool.allocate(config.default_block_size * 4).unwrap();
        assert!(big.len() >= config.default_block_size * 4);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn pool_tracks_cumulative_mapped_bytes() {
        let pool = ExecMemoryPool::new();
        let _a = pool.allocate(100).unwrap();
        let _b = pool.allocate(100).unwrap();
        assert_eq!(pool.block_count(), 1);
        assert!(pool.total_allocated() >= 200);
    }
}

//! FFI trampoline: invoking a compiled, no-argument function by raw pointer.
//!
//! Grounded on `raya_engine::jit::runtime::trampoline`'s C-ABI function
//! pointer typedef, simplified to this crate's scope (a single entry point,
//! no runtime-context argument).

use crate::error::{CodegenError, CodegenResult};
use crate::jit::memory::ExecBlock;

/// A compiled function's C-ABI signature: no arguments, a 64-bit integer
/// return value in `rax`.
pub type EntryFn = unsafe extern "C" fn() -> i64;

/// Casts `block`'s entry point to `EntryFn` and calls it.
///
/// # Safety
///
/// The caller must guarantee `block` holds code matching `EntryFn`'s
/// signature, that it has been flipped executable, and that its entry point
/// is exactly `entry_offset` bytes into the block.
pub unsafe fn invoke(block: &ExecBlock, entry_offset: usize) -> CodegenResult<i64> {
    if !block.is_executable() {
        return Err(CodegenError::PermissionFlipFailed(
            "attempted to invoke a block that was never flipped executable".into(),
        ));
    }
    if entry_offset >= block.len() {
        return Err(CodegenError::NullFfiTarget);
    }
    let entry_ptr = block.as_ptr().add(entry_offset);
    let entry: EntryFn = std::mem::transmute(entry_ptr);
    Ok(entry())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::memory::ExecMemoryPool;

    #[test]
    fn invoking_a_hand_assembled_return_function() {
        let pool = ExecMemoryPool::new();
        let mut block = pool.allocate(16).unwrap();
        // mov eax, 42 ; ret
        block.write(&[0xB8, 42, 0, 0, 0, 0xC3]).unwrap();
        block.make_executable().unwrap();
        // SAFETY: the bytes above are exactly `EntryFn`'s signature.
        let result = unsafe { invoke(&block, 0).unwrap() };
        assert_eq!(result, 42);
    }

    #[test]
    fn invoking_a_non_executable_block_is_rejected() {
        let pool = ExecMemoryPool::new();
        let block = pool.allocate(16).unwrap();
        // SAFETY: the error path is taken before any call happens.
        let result = unsafe { invoke(&block, 0) };
        assert!(result.is_err());
    }
}

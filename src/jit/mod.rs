//! JIT memory management and the driver that turns a built micro-op program
//! into callable machine code.

pub mod driver;
pub mod memory;
pub mod trampoline;

pub use driver::{CompiledFunction, EmptyResolver, JitDriver, SymbolResolver};
pub use memory::{ExecBlock, ExecMemoryPool};
pub use trampoline::{invoke, EntryFn};

use crate::callconv::CallConvKind;

/// Ambient configuration, mirroring `raya_engine::jit::engine::JitConfig`'s
/// shape: a small struct with a `Default` impl rather than scattered
/// constants, even though this crate has no prewarm/heuristics system to
/// configure (that belongs to an outer compiler scheduler, out of scope
/// here).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Size of a freshly allocated executable block when no existing block
    /// has room (rounded up to a whole page by the pool).
    pub default_block_size: usize,
    /// Overrides the OS-reported page size; `None` queries it at pool
    /// construction time.
    pub page_size_override: Option<usize>,
    /// Calling convention used when a compile call doesn't specify one.
    pub default_call_conv: CallConvKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_block_size: 64 * 1024,
            page_size_override: None,
            default_call_conv: CallConvKind::Host,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_the_host_convention() {
        let config = Config::default();
        assert_eq!(config.default_call_conv, CallConvKind::Host);
        assert_eq!(config.default_block_size, 64 * 1024);
    }
}

//! Error taxonomy for the code-generation core.
//!
//! Grounded on `raya_engine::jit::backend::traits::CodegenError` and
//! `raya_engine::jit::pipeline::JitError`: a small `thiserror`-derived enum,
//! no ad-hoc string errors scattered through the call stack.

/// Every fallible entry point into this crate returns `Result<T, CodegenError>`.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("encoder targets an unsupported architecture")]
    UnsupportedTarget,

    #[error("emitted zero bytes for a non-empty instruction stream")]
    EmptyEmission,

    #[error("legalization could not rewrite operand: {0}")]
    LegalizationFailed(String),

    #[error("memory allocation failed ({requested} bytes)")]
    AllocationFailed { requested: usize },

    #[error("failed to flip executable memory permissions: {0}")]
    PermissionFlipFailed(String),

    #[error("FFI trampoline target pointer is null")]
    NullFfiTarget,

    #[error("unknown call convention: {0:?}")]
    UnknownCallConv(crate::callconv::CallConvKind),

    #[error("unsupported instruction shape for this target: {0}")]
    UnsupportedInstruction(String),
}

/// The ternary propagation result named in the design: `Continue` is normal
/// completion, `Pause` is reserved for cooperative reentry by an outer compiler
/// scheduler. No pass in this core ever produces `Pause`; it exists purely so
/// the return type matches the documented external contract. Used by entry
/// points with no payload of their own (`LegalizePass::run`, `Encoder::emit`);
/// entries that hand back real data (`RegAllocPass::run`, `JitDriver::compile`)
/// keep a plain `CodegenResult<T>` instead of burying `T` inside this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    Continue,
    Pause,
}

pub type CodegenResult<T> = Result<T, CodegenError>;

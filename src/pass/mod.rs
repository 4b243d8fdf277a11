//! The pass pipeline: legalization and register allocation run over a
//! `MicroInstrBuilder` before it reaches the encoder.
//!
//! Grounded on `raya_engine::jit::pipeline::JitPipeline`'s generic
//! "ordered stages over a module" shape, adapted to this crate's two fixed
//! stages (legalization always runs before allocation; the source's legalizer
//! and allocator have the same ordering constraint since allocation needs
//! conformant operand shapes to compute accurate register pressure).

pub mod legalize;
pub mod regalloc;

pub use legalize::{ConformanceIssue, ConformanceOracle, LegalizePass, X64ConformanceOracle};
pub use regalloc::{Assignment, RegAllocPass, RegAllocResult};

use crate::callconv::CallConvKind;
use crate::error::CodegenResult;
use crate::micro::MicroInstrBuilder;

/// Shared state threaded through both passes.
pub struct PassContext {
    pub call_conv: CallConvKind,
}

impl PassContext {
    pub fn new(call_conv: CallConvKind) -> Self {
        Self { call_conv }
    }
}

/// Runs legalization then register allocation, returning the allocation
/// result the encoder needs for spill-slot sizing.
pub fn run_pipeline(
    builder: &mut MicroInstrBuilder,
    ctx: &PassContext,
) -> CodegenResult<RegAllocResult> {
    LegalizePass::new().run(builder, ctx)?;
    RegAllocPass::new().run(builder, ctx)
}

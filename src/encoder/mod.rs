//! The encoder trait and its sole implementation target, x86-64.
//!
//! Grounded on `Encoder.h`'s abstract base (one `encodeXxx` method per
//! micro-op, plus `getOrAddSymbol`/`addSymbolRelocation`) and
//! `raya_engine::jit::backend::traits::CodegenBackend` for the Rust-idiomatic
//! trait shape: a narrow surface the pass pipeline drives, implemented once
//! per target architecture.

pub mod bytestore;
pub mod x64;

pub use bytestore::ByteStore;
pub use x64::X64Encoder;

use crate::error::{CodegenResult, ControlFlow};
use crate::micro::{EmitFlags, MicroInstrKind, Operand, SymbolKind};
use crate::pass::ConformanceIssue;
use crate::reg::Reg;

/// Consumes a legalized, register-allocated instruction stream and produces
/// machine code plus the relocations the JIT driver must resolve once the
/// function's final address is known.
pub trait Encoder {
    /// Byte offset the next emitted instruction will start at.
    fn current_offset(&self) -> usize;

    /// The physical register this target uses as the stack pointer.
    fn stack_pointer_reg(&self) -> Reg;

    /// Emits one micro-instruction. Operands must already be legalized
    /// (register-allocated physical registers, encodable immediates). `flags`
    /// carries the instruction's `EmitFlags` (e.g. `Lock` for an atomic
    /// read-modify-write), which the operand slice itself doesn't encode.
    fn emit(&mut self, kind: MicroInstrKind, operands: &[Operand], flags: EmitFlags) -> CodegenResult<ControlFlow>;

    /// Diagnoses whether this instruction shape needs legalization before
    /// `emit` can encode it. The legalizer calls this before each instruction.
    fn query_conformance_issue(&self, kind: MicroInstrKind, operands: &[Operand]) -> Option<ConformanceIssue>;

    /// Interns or looks up a symbol by name, returning its table index.
    fn get_or_add_symbol(&mut self, name: &str, kind: SymbolKind) -> u32;

    /// Records a PC-relative relocation at the given code offset, resolved
    /// once the containing function's load address is known.
    fn add_symbol_relocation(&mut self, code_offset: usize, symbol_index: u32);

    /// Finalizes encoding and hands back the code buffer and relocations.
    fn finish(self) -> (Vec<u8>, Vec<crate::micro::Relocation>);
}

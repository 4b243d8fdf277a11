//! Micro-op IR, legalization, linear-scan register allocation, x86-64
//! encoding, and JIT executable memory management for a compiler backend.
//!
//! A frontend builds a [`micro::MicroInstrBuilder`] against a chosen
//! [`callconv::CallConvKind`], hands it to [`jit::JitDriver::compile`], and
//! gets back a [`jit::CompiledFunction`] ready to invoke through
//! [`jit::trampoline::invoke`].

pub mod callconv;
pub mod encoder;
pub mod error;
pub mod jit;
pub mod micro;
pub mod pass;
pub mod reg;

pub use callconv::{CallConv, CallConvKind};
pub use error::{CodegenError, CodegenResult, ControlFlow};
pub use jit::{CompiledFunction, JitDriver};
pub use micro::MicroInstrBuilder;

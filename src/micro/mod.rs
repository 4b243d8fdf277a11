//! The micro-op intermediate representation: architecture-abstract
//! instructions with explicit operand widths, produced by a frontend and
//! consumed by legalization, register allocation, and the encoder.

pub mod builder;
pub mod instr;
pub mod operand;
pub mod symbol;

pub use builder::{JumpRecord, MicroInstrBuilder};
pub use instr::{MicroInstr, MicroInstrKind};
pub use operand::{EmitFlags, JumpToken, NameRef, Operand};
pub use symbol::{RelocKind, RelocTarget, Relocation, Symbol, SymbolKind, SymbolTable};

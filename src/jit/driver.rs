//! Orchestrates the full pipeline from a built `MicroInstrBuilder` down to an
//! executable block: legalize, allocate registers, encode, allocate memory,
//! copy code in, resolve relocations, flip to executable.
//!
//! Grounded on `raya_engine::jit::engine::JitEngine` for the "small
//! configuration struct plus a thin driving method" shape, and on
//! `raya_engine::jit::backend::traits::SymbolResolver` for the external-symbol
//! lookup seam.

use crate::callconv::CallConvKind;
use crate::encoder::{Encoder, X64Encoder};
use crate::error::{CodegenError, CodegenResult};
use crate::jit::memory::{ExecBlock, ExecMemoryPool};
use crate::jit::Config;
use crate::micro::{MicroInstrBuilder, RelocTarget, SymbolKind};
use crate::pass::{self, PassContext};

/// Resolves a symbol name to an absolute address: a function already
/// compiled in this process, or an external (e.g. libc) symbol. The driver
/// never guesses at addresses itself.
pub trait SymbolResolver {
    fn resolve(&self, name: &str, kind: SymbolKind) -> Option<usize>;
}

/// A resolver with no entries; useful for functions with no calls or
/// external symbol references.
#[derive(Debug, Default)]
pub struct EmptyResolver;

impl SymbolResolver for EmptyResolver {
    fn resolve(&self, _name: &str, _kind: SymbolKind) -> Option<usize> {
        None
    }
}

pub struct CompiledFunction {
    pub block: ExecBlock,
    pub entry_offset: usize,
}

pub struct JitDriver {
    pool: ExecMemoryPool,
    config: Config,
}

impl JitDriver {
    pub fn new(config: Config) -> Self {
        Self {
            pool: ExecMemoryPool::with_config(&config),
            config,
        }
    }

    pub fn memory_pool(&self) -> &ExecMemoryPool {
        &self.pool
    }

    /// Compiles `builder` into an executable function. `call_conv` overrides
    /// the driver's `Config::default_call_conv` when given; pass `None` to
    /// use the configured default.
    pub fn compile(
        &self,
        mut builder: MicroInstrBuilder,
        call_conv: Option<CallConvKind>,
        resolver: &dyn SymbolResolver,
    ) -> CodegenResult<CompiledFunction> {
        let call_conv = call_conv.unwrap_or(self.config.default_call_conv).resolve();
        let ctx = PassContext::new(call_conv);
        pass::run_pipeline(&mut builder, &ctx)?;

        let mut encoder = X64Encoder::new(call_conv);
        let instrs = builder.instructions().to_vec();
        let operand_store = builder.operand_store().to_vec();
        for instr in &instrs {
            let ops = instr.operands(&operand_store);
            encoder.emit(instr.kind, ops, instr.flags)?;
        }
        let (mut code, relocations) = encoder.finish();

        if code.is_empty() {
            return Err(CodegenError::EmptyEmission);
        }

        let block = self.pool.allocate(code.len())?;
        let base = block.as_ptr() as usize;

        for reloc in &relocations {
            let target = match reloc.target {
                RelocTarget::Absolute(addr) => addr as usize,
                RelocTarget::Symbol(index) => {
                    let symbol = builder.symbols.symbol(index);
                    let name = builder.symbols.name(symbol.name).to_string();
                    resolver.resolve(&name, symbol.kind).ok_or_else(|| {
                        CodegenError::UnsupportedInstruction(format!("unresolved symbol `{name}`"))
                    })?
                }
            };
            let patch_offset = reloc.code_offset as usize;
            let rel = target as i64 - (base as i64 + patch_offset as i64 + 4);
            let rel32 = i32::try_from(rel)
                .map_err(|_| CodegenError::UnsupportedInstruction("relocation target out of rel32 range".into()))?;
            code[patch_offset..patch_offset + 4].copy_from_slice(&rel32.to_le_bytes());
        }

        let mut block = block;
        block.write(&code)?;
        block.make_executable()?;

        Ok(CompiledFunction { block, entry_offset: 0 })
    }
}

impl Default for JitDriver {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::{gpr, OpBits};

    #[test]
    fn compiles_a_trivial_return_zero_function() {
        let mut builder = MicroInstrBuilder::new();
        builder.clear_reg(gpr::RAX, OpBits::B32);
        builder.ret();

        let driver = JitDriver::new(Config::default());
        let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
        assert!(compiled.block.is_executable());
        assert!(compiled.block.len() > 0);
    }

    #[test]
    fn empty_function_body_is_rejected() {
        let builder = MicroInstrBuilder::new();
        let driver = JitDriver::new(Config::default());
        let result = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver);
        assert!(result.is_err());
    }

    #[test]
    fn compile_falls_back_to_the_configured_default_call_conv() {
        let mut builder = MicroInstrBuilder::new();
        builder.clear_reg(gpr::RAX, OpBits::B32);
        builder.ret();

        let config = Config {
            default_call_conv: CallConvKind::C,
            ..Config::default()
        };
        let driver = JitDriver::new(config);
        let compiled = driver.compile(builder, None, &EmptyResolver).unwrap();
        assert!(compiled.block.is_executable());
    }
}

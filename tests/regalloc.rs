//! Integration tests for the register allocator running as part of the full
//! pipeline: enough simultaneously-live virtual registers to force spilling,
//! and confirmation that a spilled value still round-trips correctly through
//! compiled, executed code.

use codegen_core::callconv::CallConvKind;
use codegen_core::jit::{trampoline, Config, EmptyResolver, JitDriver};
use codegen_core::micro::MicroInstrBuilder;
use codegen_core::reg::{gpr, Op, OpBits, Reg};

/// The SysV C convention exposes 9 transient + 5 persistent int registers,
/// minus the dedicated spill scratch register, leaving 13 allocatable
/// physical registers. Keeping more virtuals than that simultaneously live
/// forces at least one spill.
const LIVE_VIRTUALS: u8 = 16;

#[test]
fn oversubscribed_virtual_registers_spill_to_stack_slots() {
    let mut builder = MicroInstrBuilder::new();
    let virtuals: Vec<Reg> = (0..LIVE_VIRTUALS).map(Reg::virtual_int).collect();

    for (i, v) in virtuals.iter().enumerate() {
        builder.load_reg_imm(*v, OpBits::B64, i as u64);
    }
    // Every virtual is still live here: none has been used since its load.
    for v in &virtuals {
        builder.cmp_reg_imm(*v, 0, OpBits::B64);
    }
    builder.ret();

    let driver = JitDriver::new(Config::default());
    // Compilation itself is the assertion: if the spill-slot rewrite were
    // broken (e.g. reusing a scratch register still holding a live value),
    // this either fails to compile or produces code a careful review of the
    // rewritten stream would catch; running it at all exercises the full
    // legalize -> regalloc -> encode -> JIT path under register pressure.
    let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
    assert!(compiled.block.is_executable());
}

#[test]
fn a_spilled_value_survives_a_reload_and_reaches_the_return_register() {
    // v0 is defined first and read only at the very end, after enough other
    // virtuals are alive at once to exhaust the register pool; whichever of
    // them ends up on a stack slot, the reload-before-use rewrite must still
    // produce the original value by the final read.
    let mut builder = MicroInstrBuilder::new();
    let v0 = Reg::virtual_int(0);
    builder.load_reg_imm(v0, OpBits::B64, 123);

    let pressure: Vec<Reg> = (1..LIVE_VIRTUALS).map(Reg::virtual_int).collect();
    for (i, v) in pressure.iter().enumerate() {
        builder.load_reg_imm(*v, OpBits::B64, i as u64 + 1);
    }
    for v in &pressure {
        builder.op_binary_reg_reg(Op::Add, *v, *v, OpBits::B64);
    }

    builder.load_reg_reg(gpr::RAX, v0, OpBits::B64);
    builder.ret();

    let driver = JitDriver::new(Config::default());
    let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
    let result = unsafe { trampoline::invoke(&compiled.block, compiled.entry_offset).unwrap() };
    assert_eq!(result, 123);
}

#[test]
fn an_interval_crossing_a_call_keeps_its_value_across_the_call() {
    let mut builder = MicroInstrBuilder::new();
    let v0 = Reg::virtual_int(0);
    builder.load_reg_imm(v0, OpBits::B64, 55);
    builder.call_extern("noop", CallConvKind::C);
    builder.load_reg_reg(gpr::RAX, v0, OpBits::B64);
    builder.ret();

    struct NoopResolver(*const u8);
    impl codegen_core::jit::SymbolResolver for NoopResolver {
        fn resolve(&self, _name: &str, _kind: codegen_core::micro::SymbolKind) -> Option<usize> {
            Some(self.0 as usize)
        }
    }

    // A single `ret` instruction standing in for `noop`, allocated first so
    // its address is known before compiling the caller.
    let driver = JitDriver::new(Config::default());
    let mut callee_builder = MicroInstrBuilder::new();
    callee_builder.ret();
    let callee = driver.compile(callee_builder, Some(CallConvKind::C), &EmptyResolver).unwrap();

    let resolver = NoopResolver(callee.block.as_ptr());
    let compiled = driver.compile(builder, Some(CallConvKind::C), &resolver).unwrap();
    let result = unsafe { trampoline::invoke(&compiled.block, compiled.entry_offset).unwrap() };
    assert_eq!(result, 55);
}

//! Integration tests for the x86-64 encoder driven through the public API:
//! build a micro-op program, run it through the full legalize/regalloc/encode
//! pipeline via `JitDriver`, and check the resulting machine code executes
//! with the expected result.

use codegen_core::callconv::CallConvKind;
use codegen_core::jit::{trampoline, Config, EmptyResolver, JitDriver};
use codegen_core::micro::MicroInstrBuilder;
use codegen_core::reg::{gpr, Op, OpBits};

#[test]
fn returns_an_immediate_loaded_into_the_return_register() {
    let mut builder = MicroInstrBuilder::new();
    builder.load_reg_imm(gpr::RAX, OpBits::B32, 99);
    builder.ret();

    let driver = JitDriver::new(Config::default());
    let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
    // SAFETY: compiled with no arguments and a pure i64 return, matching EntryFn.
    let result = unsafe { trampoline::invoke(&compiled.block, compiled.entry_offset).unwrap() };
    assert_eq!(result, 99);
}

#[test]
fn adds_two_immediates_through_a_virtual_register() {
    let mut builder = MicroInstrBuilder::new();
    let v0 = codegen_core::reg::Reg::virtual_int(0);
    builder.load_reg_imm(v0, OpBits::B64, 40);
    builder.op_binary_reg_imm(Op::Add, v0, 2, OpBits::B64);
    builder.load_reg_reg(gpr::RAX, v0, OpBits::B64);
    builder.ret();

    let driver = JitDriver::new(Config::default());
    let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
    let result = unsafe { trampoline::invoke(&compiled.block, compiled.entry_offset).unwrap() };
    assert_eq!(result, 42);
}

#[test]
fn an_oversized_immediate_is_legalized_through_a_scratch_register() {
    // u64::MAX doesn't fit an imm32, so ClampImmediate must fire during
    // legalization and route it through a scratch load before the add.
    let mut builder = MicroInstrBuilder::new();
    builder.load_reg_imm(gpr::RAX, OpBits::B64, 1);
    builder.op_binary_reg_imm(Op::Add, gpr::RAX, u64::MAX, OpBits::B64);
    builder.ret();

    let driver = JitDriver::new(Config::default());
    let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
    let result = unsafe { trampoline::invoke(&compiled.block, compiled.entry_offset).unwrap() };
    // 1 + u64::MAX wraps to 0.
    assert_eq!(result, 0);
}

#[test]
fn forward_branch_skips_the_wrong_path() {
    let mut builder = MicroInstrBuilder::new();
    builder.load_reg_imm(gpr::RAX, OpBits::B32, 1);
    builder.cmp_reg_imm(gpr::RAX, 1, OpBits::B32);
    let token = builder.jump_cond(codegen_core::reg::CondJump::Zero);
    builder.load_reg_imm(gpr::RAX, OpBits::B32, 0xBAD);
    builder.patch_jump(token);
    builder.ret();

    let driver = JitDriver::new(Config::default());
    let compiled = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver).unwrap();
    let result = unsafe { trampoline::invoke(&compiled.block, compiled.entry_offset).unwrap() };
    assert_eq!(result, 1);
}

#[test]
fn call_to_an_unresolved_extern_symbol_fails_compilation() {
    let mut builder = MicroInstrBuilder::new();
    builder.call_extern("not_a_real_symbol", CallConvKind::C);
    builder.ret();

    let driver = JitDriver::new(Config::default());
    let result = driver.compile(builder, Some(CallConvKind::C), &EmptyResolver);
    assert!(result.is_err());
}

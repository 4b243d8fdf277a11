//! End-to-end JIT round trips: compile, invoke, and check the executable
//! memory pool's bookkeeping across several compiled functions.

use codegen_core::callconv::CallConvKind;
use codegen_core::jit::{trampoline, Config, EmptyResolver, JitDriver};
use codegen_core::micro::MicroInstrBuilder;
use codegen_core::reg::{gpr, OpBits};

fn build_return_constant(value: u32) -> MicroInstrBuilder {
    let mut b = MicroInstrBuilder::new();
    b.load_reg_imm(gpr::RAX, OpBits::B32, value as u64);
    b.ret();
    b
}

#[test]
fn a_single_driver_compiles_several_independent_functions() {
    let driver = JitDriver::new(Config::default());

    let a = driver.compile(build_return_constant(10), Some(CallConvKind::C), &EmptyResolver).unwrap();
    let b = driver.compile(build_return_constant(20), Some(CallConvKind::C), &EmptyResolver).unwrap();
    let c = driver.compile(build_return_constant(30), Some(CallConvKind::C), &EmptyResolver).unwrap();

    let ra = unsafe { trampoline::invoke(&a.block, a.entry_offset).unwrap() };
    let rb = unsafe { trampoline::invoke(&b.block, b.entry_offset).unwrap() };
    let rc = unsafe { trampoline::invoke(&c.block, c.entry_offset).unwrap() };

    assert_eq!((ra, rb, rc), (10, 20, 30));
    // Three small functions share one pooled block instead of one each.
    assert_eq!(driver.memory_pool().block_count(), 1);
    assert!(driver.memory_pool().total_allocated() > 0);
}

#[test]
fn compiled_blocks_are_independent_and_dont_alias() {
    let driver = JitDriver::new(Config::default());
    let a = driver.compile(build_return_constant(1), Some(CallConvKind::C), &EmptyResolver).unwrap();
    let b = driver.compile(build_return_constant(2), Some(CallConvKind::C), &EmptyResolver).unwrap();
    assert_ne!(a.block.as_ptr(), b.block.as_ptr());
}

#[test]
fn call_conv_choice_is_threaded_through_to_the_compiled_function() {
    let driver = JitDriver::new(Config::default());
    let win = driver
        .compile(build_return_constant(7), Some(CallConvKind::WindowsX64), &EmptyResolver)
        .unwrap();
    let result = unsafe { trampoline::invoke(&win.block, win.entry_offset).unwrap() };
    assert_eq!(result, 7);
}

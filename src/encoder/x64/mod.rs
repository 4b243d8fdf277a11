//! The x86-64 encoder: turns legalized, register-allocated micro-instructions
//! into machine code bytes.
//!
//! Grounded on `MicroEncoder.cpp`/`MicroOpsEncoder.cpp`'s instruction-by-
//! instruction emission and standard x86-64 encoding: REX prefixes, ModR/M,
//! SIB, and the disp0/disp8/disp32 sizing rules (RSP/R12 as a base always
//! need a SIB byte; RBP/R13 as a base with a zero displacement must still
//! emit an explicit `disp8` of 0, since `mod=00, rm=101` means RIP-relative
//! addressing in 64-bit mode, not "no displacement").

mod modrm;

use crate::callconv::CallConvKind;
use crate::encoder::{ByteStore, Encoder};
use crate::error::{CodegenError, CodegenResult, ControlFlow};
use crate::micro::{EmitFlags, MicroInstrKind, NameRef, Operand, RelocKind, RelocTarget, Relocation, SymbolKind, SymbolTable};
use crate::pass::{ConformanceIssue, ConformanceOracle, X64ConformanceOracle};
use crate::reg::{gpr, Cond, CondJump, Op, OpBits, Reg};

use modrm::{emit_modrm_amc, emit_modrm_mem, emit_modrm_reg, emit_rex, fits_i8};

/// Arithmetic-group opcode pair for a binary ALU op: `(mr, rm, group1_digit)`.
/// `mr` encodes `op r/m, reg`; `rm` encodes `op reg, r/m`; `group1_digit` is
/// the ModR/M `/digit` used by the `80`/`81`/`83` immediate-group opcodes.
/// Bit 0 of `mr`/`rm` distinguishes the 8-bit form (clear) from the
/// 16/32/64-bit form (set); `width_adjusted_opcode` flips it.
fn alu_group1(op: Op) -> CodegenResult<(u8, u8, u8)> {
    match op {
        Op::Add => Ok((0x01, 0x03, 0)),
        Op::Or => Ok((0x09, 0x0B, 1)),
        Op::And => Ok((0x21, 0x23, 4)),
        Op::Sub => Ok((0x29, 0x2B, 5)),
        Op::Xor => Ok((0x31, 0x33, 6)),
        other => Err(CodegenError::UnsupportedInstruction(format!(
            "{other:?} is not a group-1 ALU opcode"
        ))),
    }
}

/// Group-2 shift/rotate `/digit` for the immediate-count form (`C0/C1 /digit ib`).
fn shift_digit(op: Op) -> Option<u8> {
    match op {
        Op::RotateLeft => Some(0),
        Op::RotateRight => Some(1),
        Op::ShiftLeft | Op::ShiftArithmeticLeft => Some(4),
        Op::ShiftRight => Some(5),
        Op::ShiftArithmeticRight => Some(7),
        _ => None,
    }
}

fn width_adjusted_opcode(base: u8, width: OpBits) -> u8 {
    if width == OpBits::B8 {
        base & !1
    } else {
        base | 1
    }
}

fn condition_code(cond: Cond) -> u8 {
    match cond {
        Cond::Overflow => 0x0,
        Cond::Below => 0x2,
        Cond::AboveOrEqual => 0x3,
        Cond::Equal => 0x4,
        Cond::NotEqual => 0x5,
        Cond::BelowOrEqual => 0x6,
        Cond::Above => 0x7,
        Cond::NotAbove => 0x6,
        Cond::Parity => 0xA,
        Cond::NotParity => 0xB,
        Cond::Less => 0xC,
        Cond::GreaterOrEqual => 0xD,
        Cond::LessOrEqual => 0xE,
        Cond::Greater => 0xF,
        Cond::EvenParity => 0x4,
        Cond::NotEvenParity => 0x5,
    }
}

fn cond_jump_code(cond: CondJump) -> Option<u8> {
    Some(match cond {
        CondJump::Above => 0x7,
        CondJump::AboveOrEqual => 0x3,
        CondJump::Below => 0x2,
        CondJump::BelowOrEqual => 0x6,
        CondJump::Greater => 0xF,
        CondJump::GreaterOrEqual => 0xD,
        CondJump::Less => 0xC,
        CondJump::LessOrEqual => 0xE,
        CondJump::NotOverflow => 0x1,
        CondJump::NotParity => 0xB,
        CondJump::NotZero => 0x5,
        CondJump::Parity => 0xA,
        CondJump::Sign => 0x8,
        CondJump::Zero => 0x4,
        CondJump::Unconditional => return None,
    })
}

/// Where a not-yet-resolved jump's rel32 placeholder lives.
#[derive(Debug, Clone, Copy)]
struct PendingJump {
    patch_offset: usize,
}

pub struct X64Encoder {
    code: ByteStore,
    symbols: SymbolTable,
    relocations: Vec<Relocation>,
    oracle: X64ConformanceOracle,
    pending_jumps: Vec<PendingJump>,
    call_conv: CallConvKind,
}

impl X64Encoder {
    pub fn new(call_conv: CallConvKind) -> Self {
        Self {
            code: ByteStore::new(),
            symbols: SymbolTable::new(),
            relocations: Vec::new(),
            oracle: X64ConformanceOracle,
            pending_jumps: Vec::new(),
            call_conv,
        }
    }

    /// The calling convention this encoder was constructed against, used by
    /// the JIT driver to size shadow space and choose argument registers.
    pub fn call_conv(&self) -> CallConvKind {
        self.call_conv
    }

    fn width_prefix(&mut self, width: OpBits) {
        if width == OpBits::B16 {
            self.code.push(0x66);
        }
    }

    fn rex_w(width: OpBits) -> bool {
        width == OpBits::B64
    }

    fn emit_reg_reg_alu(&mut self, op: Op, dst: Reg, src: Reg, width: OpBits) -> CodegenResult<()> {
        let (mr, _, _) = alu_group1(op)?;
        self.width_prefix(width);
        emit_rex(&mut self.code, Self::rex_w(width), src, None, dst);
        self.code.push(width_adjusted_opcode(mr, width));
        emit_modrm_reg(&mut self.code, src, dst);
        Ok(())
    }

    fn emit_reg_imm_alu(&mut self, op: Op, dst: Reg, value: u64, width: OpBits) -> CodegenResult<()> {
        let (_, _, digit) = alu_group1(op)?;
        let digit_reg = Reg::int(digit);
        self.width_prefix(width);
        emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, dst);
        self.emit_group1_imm(digit_reg, dst, value as i64, width);
        Ok(())
    }

    fn emit_group1_imm(&mut self, digit_reg: Reg, rm: Reg, value: i64, width: OpBits) {
        match width {
            OpBits::B8 => {
                self.code.push(0x80);
                emit_modrm_reg(&mut self.code, digit_reg, rm);
                self.code.push(value as u8);
            }
            OpBits::B16 => {
                if fits_i8(value) {
                    self.code.push(0x83);
                    emit_modrm_reg(&mut self.code, digit_reg, rm);
                    self.code.push(value as i8 as u8);
                } else {
                    self.code.push(0x81);
                    emit_modrm_reg(&mut self.code, digit_reg, rm);
                    self.code.extend(&(value as i16).to_le_bytes());
                }
            }
            _ => {
                if fits_i8(value) {
                    self.code.push(0x83);
                    emit_modrm_reg(&mut self.code, digit_reg, rm);
                    self.code.push(value as i8 as u8);
                } else {
                    self.code.push(0x81);
                    emit_modrm_reg(&mut self.code, digit_reg, rm);
                    self.code.extend(&(value as i32).to_le_bytes());
                }
            }
        }
    }

    fn emit_mov_reg_reg(&mut self, dst: Reg, src: Reg, width: OpBits) {
        if dst.is_float() || src.is_float() {
            // movq/movd between a GPR and an XMM register, or xmm-xmm move.
            self.code.push(0xF3);
            if dst.is_float() && src.is_float() {
                emit_rex(&mut self.code, false, dst, None, src);
                self.code.extend(&[0x0F, 0x7E]);
            } else if dst.is_float() {
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, src);
                self.code.extend(&[0x0F, 0x6E]);
            } else {
                emit_rex(&mut self.code, Self::rex_w(width), src, None, dst);
                self.code.extend(&[0x0F, 0x7E]);
            }
            emit_modrm_reg(&mut self.code, if dst.is_float() { dst } else { src }, if dst.is_float() { src } else { dst });
            return;
        }
        self.width_prefix(width);
        emit_rex(&mut self.code, Self::rex_w(width), src, None, dst);
        self.code.push(width_adjusted_opcode(0x88, width));
        emit_modrm_reg(&mut self.code, src, dst);
    }

    fn emit_mov_reg_imm(&mut self, dst: Reg, width: OpBits, value: u64) {
        self.width_prefix(width);
        let rex_w = width == OpBits::B64;
        emit_rex(&mut self.code, rex_w, Reg::int(0), None, dst);
        if width == OpBits::B8 {
            self.code.push(0xB0 + dst.low3());
            self.code.push(value as u8);
        } else if rex_w {
            self.code.push(0xB8 + dst.low3());
            self.code.extend(&value.to_le_bytes());
        } else {
            self.code.push(0xB8 + dst.low3());
            let bytes = if width == OpBits::B16 {
                (value as u16).to_le_bytes().to_vec()
            } else {
                (value as u32).to_le_bytes().to_vec()
            };
            self.code.extend(&bytes);
        }
    }

    fn emit_cmp_reg_reg(&mut self, lhs: Reg, rhs: Reg, width: OpBits) {
        self.width_prefix(width);
        emit_rex(&mut self.code, Self::rex_w(width), rhs, None, lhs);
        self.code.push(width_adjusted_opcode(0x39, width));
        emit_modrm_reg(&mut self.code, rhs, lhs);
    }

    fn emit_cmp_reg_imm(&mut self, lhs: Reg, value: u64, width: OpBits) {
        let digit_reg = Reg::int(7);
        self.width_prefix(width);
        emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, lhs);
        self.emit_group1_imm(digit_reg, lhs, value as i64, width);
    }

    fn emit_mem_digit(&mut self, digit: u8, base: Reg, offset: i32, width: OpBits, opcode: &[u8]) {
        self.width_prefix(width);
        let digit_reg = Reg::int(digit);
        emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, base);
        self.code.extend(opcode);
        emit_modrm_mem(&mut self.code, digit_reg, base, offset);
    }

    fn emit_jump(&mut self, cond: CondJump) {
        match cond_jump_code(cond) {
            None => {
                self.code.push(0xE9);
            }
            Some(cc) => {
                self.code.extend(&[0x0F, 0x80 + cc]);
            }
        }
        let patch_offset = self.code.size();
        self.code.extend(&[0, 0, 0, 0]);
        self.pending_jumps.push(PendingJump { patch_offset });
    }

    fn patch_jump_at(&mut self, token_index: usize, destination: usize) {
        let pending = self.pending_jumps[token_index];
        let rel = destination as i64 - (pending.patch_offset as i64 + 4);
        self.code.patch_i32(pending.patch_offset, rel as i32);
    }
}

impl Encoder for X64Encoder {
    fn current_offset(&self) -> usize {
        self.code.size()
    }

    fn stack_pointer_reg(&self) -> Reg {
        crate::reg::gpr::RSP
    }

    fn query_conformance_issue(&self, kind: MicroInstrKind, operands: &[Operand]) -> Option<ConformanceIssue> {
        self.oracle.query(kind, operands)
    }

    fn get_or_add_symbol(&mut self, name: &str, kind: SymbolKind) -> u32 {
        self.symbols.intern(name);
        self.symbols.get_or_add_symbol(name, kind)
    }

    fn add_symbol_relocation(&mut self, code_offset: usize, symbol_index: u32) {
        self.relocations.push(Relocation {
            code_offset: code_offset as u32,
            target: RelocTarget::Symbol(symbol_index),
            kind: RelocKind::Rel32,
        });
    }

    #[allow(clippy::too_many_lines)]
    fn emit(&mut self, kind: MicroInstrKind, operands: &[Operand], flags: EmitFlags) -> CodegenResult<ControlFlow> {
        use MicroInstrKind::*;
        match kind {
            Nop => self.code.push(0x90),
            Ret => self.code.push(0xC3),
            Push => {
                let reg = operands[0].as_reg();
                emit_rex(&mut self.code, false, Reg::int(0), None, reg);
                self.code.push(0x50 + reg.low3());
            }
            Pop => {
                let reg = operands[0].as_reg();
                emit_rex(&mut self.code, false, Reg::int(0), None, reg);
                self.code.push(0x58 + reg.low3());
            }
            CallLocal | CallExtern => {
                let name = operands[0].as_name();
                let symbol_kind = if kind == CallLocal {
                    SymbolKind::Function
                } else {
                    SymbolKind::Extern
                };
                let index = self.get_or_add_symbol_for(name, symbol_kind);
                self.code.push(0xE8);
                let patch_offset = self.code.size();
                self.code.extend(&[0, 0, 0, 0]);
                self.add_symbol_relocation(patch_offset, index);
            }
            CallReg => {
                let target = operands[0].as_reg();
                let digit_reg = Reg::int(2);
                emit_rex(&mut self.code, false, digit_reg, None, target);
                self.code.push(0xFF);
                emit_modrm_reg(&mut self.code, digit_reg, target);
            }
            JumpCond => {
                let cond = operands[0].as_cond_jump();
                self.emit_jump(cond);
            }
            PatchJump | PatchJumpTo => {
                let token = operands[0].as_jump();
                let destination = operands[1].as_u64() as usize;
                self.patch_jump_at(token.0 as usize, destination);
            }
            JumpReg => {
                let target = operands[0].as_reg();
                let digit_reg = Reg::int(4);
                emit_rex(&mut self.code, false, digit_reg, None, target);
                self.code.push(0xFF);
                emit_modrm_reg(&mut self.code, digit_reg, target);
            }
            LoadRegReg => {
                let (dst, src, width) = (operands[0].as_reg(), operands[1].as_reg(), operands[2].as_width());
                self.emit_mov_reg_reg(dst, src, width);
            }
            LoadRegImm => {
                let (dst, width, value) = (operands[0].as_reg(), operands[1].as_width(), operands[2].as_u64());
                self.emit_mov_reg_imm(dst, width, value);
            }
            LoadRegMem => {
                let (dst, base, offset, width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, base);
                self.code.push(width_adjusted_opcode(0x8A, width));
                emit_modrm_mem(&mut self.code, dst, base, offset);
            }
            LoadMemReg => {
                let (base, offset, src, width) = (
                    operands[0].as_reg(),
                    operands[1].as_u64() as i32,
                    operands[2].as_reg(),
                    operands[3].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), src, None, base);
                self.code.push(width_adjusted_opcode(0x88, width));
                emit_modrm_mem(&mut self.code, src, base, offset);
            }
            LoadMemImm => {
                let (base, offset, value, width) = (
                    operands[0].as_reg(),
                    operands[1].as_u64() as i32,
                    operands[2].as_u64(),
                    operands[3].as_width(),
                );
                self.width_prefix(width);
                let digit_reg = Reg::int(0);
                emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, base);
                self.code.push(if width == OpBits::B8 { 0xC6 } else { 0xC7 });
                emit_modrm_mem(&mut self.code, digit_reg, base, offset);
                match width {
                    OpBits::B8 => self.code.push(value as u8),
                    OpBits::B16 => self.code.extend(&(value as u16).to_le_bytes()),
                    _ => self.code.extend(&(value as u32).to_le_bytes()),
                }
            }
            LoadAddrRegMem => {
                let (dst, base, offset, width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, base);
                self.code.push(0x8D);
                emit_modrm_mem(&mut self.code, dst, base, offset);
            }
            LoadAmcRegMem => {
                let (dst, base, index, scale, offset, width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_reg(),
                    operands[3].as_u64() as u32,
                    operands[4].as_u64() as i32,
                    operands[5].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, Some(index), base);
                self.code.push(width_adjusted_opcode(0x8A, width));
                emit_modrm_amc(&mut self.code, dst, base, index, scale, offset);
            }
            LoadAmcMemReg => {
                let (base, index, scale, offset, src, width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as u32,
                    operands[3].as_u64() as i32,
                    operands[4].as_reg(),
                    operands[5].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), src, Some(index), base);
                self.code.push(width_adjusted_opcode(0x88, width));
                emit_modrm_amc(&mut self.code, src, base, index, scale, offset);
            }
            LoadAddrAmcRegMem => {
                let (dst, base, index, scale, offset) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_reg(),
                    operands[3].as_u64() as u32,
                    operands[4].as_u64() as i32,
                );
                emit_rex(&mut self.code, true, dst, Some(index), base);
                self.code.push(0x8D);
                emit_modrm_amc(&mut self.code, dst, base, index, scale, offset);
            }
            CmpRegReg => {
                let (lhs, rhs, width) = (operands[0].as_reg(), operands[1].as_reg(), operands[2].as_width());
                self.emit_cmp_reg_reg(lhs, rhs, width);
            }
            CmpRegImm => {
                let (lhs, value, width) = (operands[0].as_reg(), operands[1].as_u64(), operands[2].as_width());
                self.emit_cmp_reg_imm(lhs, value, width);
            }
            CmpMemReg => {
                let (base, offset, rhs, width) = (
                    operands[0].as_reg(),
                    operands[1].as_u64() as i32,
                    operands[2].as_reg(),
                    operands[3].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), rhs, None, base);
                self.code.push(width_adjusted_opcode(0x38, width));
                emit_modrm_mem(&mut self.code, rhs, base, offset);
            }
            CmpMemImm => {
                let (base, offset, value, width) = (
                    operands[0].as_reg(),
                    operands[1].as_u64() as i32,
                    operands[2].as_u64(),
                    operands[3].as_width(),
                );
                self.emit_mem_digit(7, base, offset, width, &[if width == OpBits::B8 { 0x80 } else if fits_i8(value as i64) { 0x83 } else { 0x81 }]);
                match width {
                    _ if fits_i8(value as i64) || width == OpBits::B8 => self.code.push(value as u8),
                    OpBits::B16 => self.code.extend(&(value as u16).to_le_bytes()),
                    _ => self.code.extend(&(value as u32).to_le_bytes()),
                }
            }
            SetCondReg => {
                let (dst, cond) = (operands[0].as_reg(), operands[1].as_cond());
                emit_rex(&mut self.code, false, Reg::int(0), None, dst);
                self.code.extend(&[0x0F, 0x90 + condition_code(cond)]);
                emit_modrm_reg(&mut self.code, Reg::int(0), dst);
            }
            LoadCondRegReg => {
                let (dst, src, cond, width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_cond(),
                    operands[3].as_width(),
                );
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, src);
                self.code.extend(&[0x0F, 0x40 + condition_code(cond)]);
                emit_modrm_reg(&mut self.code, dst, src);
            }
            ClearReg => {
                let (dst, width) = (operands[0].as_reg(), operands[1].as_width());
                self.emit_reg_reg_alu(Op::Xor, dst, dst, if width == OpBits::B64 { OpBits::B32 } else { width })?;
            }
            OpUnaryReg => {
                let (op, dst, width) = (operands[0].as_op_kind(), operands[1].as_reg(), operands[2].as_width());
                self.emit_unary_reg(op, dst, width)?;
            }
            OpUnaryMem => {
                let (op, base, offset, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_width(),
                );
                self.emit_unary_mem(op, base, offset, width)?;
            }
            OpBinaryRegReg => {
                let (op, dst, rhs, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_reg(),
                    operands[3].as_width(),
                );
                self.emit_binary_reg_reg(op, dst, rhs, width)?;
            }
            OpBinaryRegImm => {
                let (op, dst, value, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_u64(),
                    operands[3].as_width(),
                );
                match shift_digit(op) {
                    Some(digit) => self.emit_shift_imm8(digit, dst, value as u8, width),
                    None => self.emit_reg_imm_alu(op, dst, value, width)?,
                }
            }
            OpBinaryRegMem => {
                let (op, dst, base, offset, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_reg(),
                    operands[3].as_u64() as i32,
                    operands[4].as_width(),
                );
                let (_, rm, _) = alu_group1(op)?;
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, base);
                self.code.push(width_adjusted_opcode(rm, width));
                emit_modrm_mem(&mut self.code, dst, base, offset);
            }
            OpBinaryMemReg => {
                let (op, base, offset, rhs, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_reg(),
                    operands[4].as_width(),
                );
                let (mr, _, _) = alu_group1(op)?;
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), rhs, None, base);
                self.code.push(width_adjusted_opcode(mr, width));
                emit_modrm_mem(&mut self.code, rhs, base, offset);
            }
            OpBinaryMemImm => {
                let (op, base, offset, value, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_u64(),
                    operands[4].as_width(),
                );
                let (_, _, digit) = alu_group1(op)?;
                let opcode = if width == OpBits::B8 {
                    0x80
                } else if fits_i8(value as i64) {
                    0x83
                } else {
                    0x81
                };
                self.emit_mem_digit(digit, base, offset, width, &[opcode]);
                match width {
                    _ if width == OpBits::B8 || fits_i8(value as i64) => self.code.push(value as u8),
                    OpBits::B16 => self.code.extend(&(value as u16).to_le_bytes()),
                    _ => self.code.extend(&(value as u32).to_le_bytes()),
                }
            }
            OpTernaryRegRegReg => {
                let (op, dst, lhs, rhs, width) = (
                    operands[0].as_op_kind(),
                    operands[1].as_reg(),
                    operands[2].as_reg(),
                    operands[3].as_reg(),
                    operands[4].as_width(),
                );
                self.emit_ternary_reg_reg_reg(op, dst, lhs, rhs, width, flags)?;
            }
            LoadSignExtRegReg => {
                let (dst, src, dst_width, src_width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_width(),
                    operands[3].as_width(),
                );
                self.emit_movsx_reg(dst, src, dst_width, src_width);
            }
            LoadSignExtRegMem => {
                let (dst, base, offset, dst_width, src_width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_width(),
                    operands[4].as_width(),
                );
                self.emit_movsx_mem(dst, base, offset, dst_width, src_width);
            }
            LoadZeroExtRegReg => {
                let (dst, src, dst_width, src_width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_width(),
                    operands[3].as_width(),
                );
                self.emit_movzx_reg(dst, src, dst_width, src_width);
            }
            LoadZeroExtRegMem => {
                let (dst, base, offset, dst_width, src_width) = (
                    operands[0].as_reg(),
                    operands[1].as_reg(),
                    operands[2].as_u64() as i32,
                    operands[3].as_width(),
                    operands[4].as_width(),
                );
                self.emit_movzx_mem(dst, base, offset, dst_width, src_width);
            }
            LoadAmcMemImm => {
                return Err(CodegenError::UnsupportedInstruction(
                    "AMC memory-immediate stores should have been split by legalization".into(),
                ))
            }
            LoadSymbolRelocAddress => {
                let (dst, name) = (operands[0].as_reg(), operands[1].as_name());
                let index = self.get_or_add_symbol_for(name, SymbolKind::Constant);
                emit_rex(&mut self.code, true, dst, None, Reg::no_base());
                self.code.push(0x8D);
                // mod=00, rm=101: RIP-relative, disp32 patched via relocation.
                self.code.push((dst.low3() << 3) | 0b101);
                let patch_offset = self.code.size();
                self.code.extend(&[0, 0, 0, 0]);
                self.add_symbol_relocation(patch_offset, index);
            }
            LoadSymRelocValue => {
                let (dst, name, width) = (operands[0].as_reg(), operands[1].as_name(), operands[2].as_width());
                let index = self.get_or_add_symbol_for(name, SymbolKind::Constant);
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, Reg::no_base());
                self.code.push(width_adjusted_opcode(0x8A, width));
                self.code.push((dst.low3() << 3) | 0b101);
                let patch_offset = self.code.size();
                self.code.extend(&[0, 0, 0, 0]);
                self.add_symbol_relocation(patch_offset, index);
            }
        }
        Ok(ControlFlow::Continue)
    }

    fn finish(self) -> (Vec<u8>, Vec<Relocation>) {
        (self.code.data().to_vec(), self.relocations)
    }
}

impl X64Encoder {
    fn get_or_add_symbol_for(&mut self, name_ref: NameRef, kind: SymbolKind) -> u32 {
        let name = self.symbols.name(name_ref).to_string();
        self.symbols.get_or_add_symbol(&name, kind)
    }

    fn emit_unary_reg(&mut self, op: Op, dst: Reg, width: OpBits) -> CodegenResult<()> {
        match op {
            Op::BitwiseNot | Op::Negate => {
                let digit = if op == Op::BitwiseNot { 2 } else { 3 };
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), Reg::int(digit), None, dst);
                self.code.push(width_adjusted_opcode(0xF6, width));
                emit_modrm_reg(&mut self.code, Reg::int(digit), dst);
            }
            Op::ByteSwap => {
                emit_rex(&mut self.code, Self::rex_w(width), Reg::int(0), None, dst);
                self.code.push(0x0F);
                self.code.push(0xC8 + dst.low3());
            }
            Op::PopCount => {
                self.code.push(0xF3);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, dst);
                self.code.extend(&[0x0F, 0xB8]);
                emit_modrm_reg(&mut self.code, dst, dst);
            }
            Op::BitScanForward | Op::BitScanReverse => {
                let opcode = if op == Op::BitScanForward { 0xBC } else { 0xBD };
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, dst);
                self.code.extend(&[0x0F, opcode]);
                emit_modrm_reg(&mut self.code, dst, dst);
            }
            other => {
                return Err(CodegenError::UnsupportedInstruction(format!(
                    "{other:?} has no unary register-operand form on this target"
                )))
            }
        }
        Ok(())
    }

    fn emit_unary_mem(&mut self, op: Op, base: Reg, offset: i32, width: OpBits) -> CodegenResult<()> {
        let digit = match op {
            Op::BitwiseNot => 2,
            Op::Negate => 3,
            other => {
                return Err(CodegenError::UnsupportedInstruction(format!(
                    "{other:?} has no unary memory-operand form on this target"
                )))
            }
        };
        self.emit_mem_digit(digit, base, offset, width, &[width_adjusted_opcode(0xF6, width)]);
        Ok(())
    }

    fn emit_binary_reg_reg(&mut self, op: Op, dst: Reg, rhs: Reg, width: OpBits) -> CodegenResult<()> {
        match op {
            Op::Add | Op::Sub | Op::And | Op::Or | Op::Xor => self.emit_reg_reg_alu(op, dst, rhs, width),
            Op::MultiplySigned => {
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, rhs);
                self.code.extend(&[0x0F, 0xAF]);
                emit_modrm_reg(&mut self.code, dst, rhs);
                Ok(())
            }
            // Group-3 `div`/`idiv`/`mul` operate on rax:rdx implicitly; `dst`
            // names the accumulator by convention (it is not separately
            // encoded), `rhs` is the divisor/multiplier register.
            Op::MultiplyUnsigned => {
                self.emit_group3(4, rhs, width);
                Ok(())
            }
            Op::DivideUnsigned => {
                self.emit_reg_reg_alu(Op::Xor, gpr::RDX, gpr::RDX, width)?;
                self.emit_group3(6, rhs, width);
                Ok(())
            }
            Op::ModuloUnsigned => {
                self.emit_reg_reg_alu(Op::Xor, gpr::RDX, gpr::RDX, width)?;
                self.emit_group3(6, rhs, width);
                self.emit_mov_reg_reg(gpr::RAX, gpr::RDX, width);
                Ok(())
            }
            Op::DivideSigned => {
                self.emit_sign_extend_accumulator(width);
                self.emit_group3(7, rhs, width);
                Ok(())
            }
            Op::ModuloSigned => {
                self.emit_sign_extend_accumulator(width);
                self.emit_group3(7, rhs, width);
                self.emit_mov_reg_reg(gpr::RAX, gpr::RDX, width);
                Ok(())
            }
            // Shift/rotate count comes from `cl`; `rhs` is unused beyond
            // carrying that convention (the builder always passes rcx there).
            Op::ShiftLeft | Op::ShiftArithmeticLeft => {
                self.emit_shift_cl(4, dst, width);
                Ok(())
            }
            Op::ShiftRight => {
                self.emit_shift_cl(5, dst, width);
                Ok(())
            }
            Op::ShiftArithmeticRight => {
                self.emit_shift_cl(7, dst, width);
                Ok(())
            }
            Op::RotateLeft => {
                self.emit_shift_cl(0, dst, width);
                Ok(())
            }
            Op::RotateRight => {
                self.emit_shift_cl(1, dst, width);
                Ok(())
            }
            Op::Exchange => {
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), dst, None, rhs);
                self.code.push(width_adjusted_opcode(0x86, width));
                emit_modrm_reg(&mut self.code, dst, rhs);
                Ok(())
            }
            Op::FloatAdd | Op::FloatSubtract | Op::FloatMultiply | Op::FloatDivide | Op::FloatSqrt | Op::FloatMin | Op::FloatMax => {
                self.code.push(0xF2);
                emit_rex(&mut self.code, false, dst, None, rhs);
                let opcode = match op {
                    Op::FloatAdd => 0x58,
                    Op::FloatSubtract => 0x5C,
                    Op::FloatMultiply => 0x59,
                    Op::FloatDivide => 0x5E,
                    Op::FloatSqrt => 0x51,
                    Op::FloatMin => 0x5D,
                    Op::FloatMax => 0x5F,
                    _ => unreachable!(),
                };
                self.code.extend(&[0x0F, opcode]);
                emit_modrm_reg(&mut self.code, dst, rhs);
                Ok(())
            }
            Op::FloatAnd | Op::FloatXor => {
                emit_rex(&mut self.code, false, dst, None, rhs);
                let opcode = if op == Op::FloatAnd { 0x54 } else { 0x57 };
                self.code.extend(&[0x0F, opcode]);
                emit_modrm_reg(&mut self.code, dst, rhs);
                Ok(())
            }
            other => Err(CodegenError::UnsupportedInstruction(format!(
                "{other:?} has no register-register form on this target"
            ))),
        }
    }

    /// `dst` names the implicit `rax` comparand and isn't separately encoded;
    /// `lhs` is the memory operand's base register (`[lhs]`), `rhs` is the
    /// register compared against `[lhs]` and conditionally stored into it.
    fn emit_ternary_reg_reg_reg(
        &mut self,
        op: Op,
        _dst: Reg,
        lhs: Reg,
        rhs: Reg,
        width: OpBits,
        flags: EmitFlags,
    ) -> CodegenResult<()> {
        match op {
            Op::CompareExchange => {
                if flags.contains(EmitFlags::LOCK) {
                    self.code.push(0xF0);
                }
                self.width_prefix(width);
                emit_rex(&mut self.code, Self::rex_w(width), rhs, None, lhs);
                self.code.push(0x0F);
                self.code.push(if width == OpBits::B8 { 0xB0 } else { 0xB1 });
                emit_modrm_mem(&mut self.code, rhs, lhs, 0);
                Ok(())
            }
            other => Err(CodegenError::UnsupportedInstruction(format!(
                "{other:?} has no ternary register-operand form on this target"
            ))),
        }
    }

    /// Group-3 `F6/F7 /digit`: `test`(0)/`not`(2)/`neg`(3)/`mul`(4)/`imul`(5)/
    /// `div`(6)/`idiv`(7), operating on `rdx:rax` implicitly for mul/div.
    fn emit_group3(&mut self, digit: u8, rm: Reg, width: OpBits) {
        self.width_prefix(width);
        let digit_reg = Reg::int(digit);
        emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, rm);
        self.code.push(width_adjusted_opcode(0xF6, width));
        emit_modrm_reg(&mut self.code, digit_reg, rm);
    }

    /// `cqo`/`cdq`/`cwd`: sign-extends the accumulator into `rdx:rax` ahead of
    /// a signed divide.
    fn emit_sign_extend_accumulator(&mut self, width: OpBits) {
        self.width_prefix(width);
        if Self::rex_w(width) {
            self.code.push(0x48);
        }
        self.code.push(0x99);
    }

    /// Group-2 shift/rotate by `cl`: `D2/D3 /digit`.
    fn emit_shift_cl(&mut self, digit: u8, dst: Reg, width: OpBits) {
        self.width_prefix(width);
        let digit_reg = Reg::int(digit);
        emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, dst);
        self.code.push(width_adjusted_opcode(0xD2, width));
        emit_modrm_reg(&mut self.code, digit_reg, dst);
    }

    /// Group-2 shift/rotate by an immediate count: `C0/C1 /digit ib`.
    fn emit_shift_imm8(&mut self, digit: u8, dst: Reg, count: u8, width: OpBits) {
        self.width_prefix(width);
        let digit_reg = Reg::int(digit);
        emit_rex(&mut self.code, Self::rex_w(width), digit_reg, None, dst);
        self.code.push(width_adjusted_opcode(0xC0, width));
        emit_modrm_reg(&mut self.code, digit_reg, dst);
        self.code.push(count);
    }

    fn emit_movsx_reg(&mut self, dst: Reg, src: Reg, dst_width: OpBits, src_width: OpBits) {
        emit_rex(&mut self.code, Self::rex_w(dst_width), dst, None, src);
        if src_width == OpBits::B32 {
            self.code.push(0x63); // MOVSXD
        } else {
            self.code.push(0x0F);
            self.code.push(if src_width == OpBits::B8 { 0xBE } else { 0xBF });
        }
        emit_modrm_reg(&mut self.code, dst, src);
    }

    fn emit_movsx_mem(&mut self, dst: Reg, base: Reg, offset: i32, dst_width: OpBits, src_width: OpBits) {
        emit_rex(&mut self.code, Self::rex_w(dst_width), dst, None, base);
        if src_width == OpBits::B32 {
            self.code.push(0x63);
        } else {
            self.code.push(0x0F);
            self.code.push(if src_width == OpBits::B8 { 0xBE } else { 0xBF });
        }
        emit_modrm_mem(&mut self.code, dst, base, offset);
    }

    fn emit_movzx_reg(&mut self, dst: Reg, src: Reg, dst_width: OpBits, src_width: OpBits) {
        if src_width == OpBits::B32 {
            // Zero-extension to 64 bits is a side effect of any 32-bit write.
            self.emit_mov_reg_reg(dst, src, OpBits::B32);
            return;
        }
        emit_rex(&mut self.code, Self::rex_w(dst_width), dst, None, src);
        self.code.push(0x0F);
        self.code.push(if src_width == OpBits::B8 { 0xB6 } else { 0xB7 });
        emit_modrm_reg(&mut self.code, dst, src);
    }

    fn emit_movzx_mem(&mut self, dst: Reg, base: Reg, offset: i32, dst_width: OpBits, src_width: OpBits) {
        if src_width == OpBits::B32 {
            self.width_prefix(OpBits::B32);
            emit_rex(&mut self.code, false, dst, None, base);
            self.code.push(0x8B);
            emit_modrm_mem(&mut self.code, dst, base, offset);
            return;
        }
        emit_rex(&mut self.code, Self::rex_w(dst_width), dst, None, base);
        self.code.push(0x0F);
        self.code.push(if src_width == OpBits::B8 { 0xB6 } else { 0xB7 });
        emit_modrm_mem(&mut self.code, dst, base, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::gpr;

    #[test]
    fn ret_is_a_single_byte() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(MicroInstrKind::Ret, &[], EmitFlags::ZERO).unwrap();
        assert_eq!(enc.finish().0, vec![0xC3]);
    }

    #[test]
    fn reg_reg_mov_needs_no_rex_for_low_registers() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::LoadRegReg,
            &[Operand::Reg(gpr::RCX), Operand::Reg(gpr::RAX), Operand::Width(OpBits::B32)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code, vec![0x89, 0xC1]);
    }

    #[test]
    fn reg_reg_mov_needs_rex_for_extended_registers() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::LoadRegReg,
            &[Operand::Reg(gpr::R9), Operand::Reg(gpr::R8), Operand::Width(OpBits::B64)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code[0], 0x4D); // REX.W.R.B
    }

    #[test]
    fn mov_reg_imm64_uses_movabs_form() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::LoadRegImm,
            &[Operand::Reg(gpr::RAX), Operand::Width(OpBits::B64), Operand::ImmU64(0x1122334455667788)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code[0], 0x48); // REX.W
        assert_eq!(code[1], 0xB8);
        assert_eq!(&code[2..10], &0x1122334455667788u64.to_le_bytes());
    }

    #[test]
    fn mem_operand_with_rsp_base_forces_sib() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::LoadRegMem,
            &[Operand::Reg(gpr::RAX), Operand::Reg(gpr::RSP), Operand::ImmI32(0), Operand::Width(OpBits::B64)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        // REX.W, opcode 8B, modrm(00,000,100), sib(00,100,100)
        assert_eq!(code[2], 0x8B);
        assert_eq!(code[3] & 0xC7, 0x04);
        assert_eq!(code[4], 0x24);
    }

    #[test]
    fn mem_operand_with_rbp_base_and_zero_disp_forces_disp8() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::LoadRegMem,
            &[Operand::Reg(gpr::RAX), Operand::Reg(gpr::RBP), Operand::ImmI32(0), Operand::Width(OpBits::B64)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code[3] >> 6, 0b01); // mod=01 (disp8), not disp0
        assert_eq!(code[4], 0);
    }

    #[test]
    fn call_extern_emits_e8_and_a_relocation() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        let name = enc.symbols.intern("malloc");
        enc.emit(
            MicroInstrKind::CallExtern,
            &[Operand::Name(name), Operand::CallConv(CallConvKind::C)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, relocs) = enc.finish();
        assert_eq!(code[0], 0xE8);
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].code_offset, 1);
    }

    #[test]
    fn unconditional_jump_patches_rel32_forward() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::JumpCond,
            &[Operand::CondJump(CondJump::Unconditional), Operand::Jump(crate::micro::JumpToken(0))],
            EmitFlags::ZERO,
        )
        .unwrap();
        enc.emit(MicroInstrKind::Nop, &[], EmitFlags::ZERO).unwrap();
        let dest = enc.current_offset();
        enc.emit(
            MicroInstrKind::PatchJump,
            &[Operand::Jump(crate::micro::JumpToken(0)), Operand::ImmU32(dest as u32)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code[0], 0xE9);
        let rel = i32::from_le_bytes(code[1..5].try_into().unwrap());
        assert_eq!(rel, 1); // one NOP byte between the patch site's end and dest
    }

    #[test]
    fn reg_reg_alu_picks_the_mr_opcode_and_modrm_direction() {
        // op_binary_reg_reg(r8, r9, ADD, B64) pins to `4D 01 C8`.
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::OpBinaryRegReg,
            &[Operand::OpKind(Op::Add), Operand::Reg(gpr::R8), Operand::Reg(gpr::R9), Operand::Width(OpBits::B64)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code, vec![0x4D, 0x01, 0xC8]);
    }

    #[test]
    fn clear_reg_xors_rdx_with_itself() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::ClearReg,
            &[Operand::Reg(gpr::RDX), Operand::Width(OpBits::B64)],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code, vec![0x31, 0xD2]);
    }

    #[test]
    fn locked_cmpxchg_emits_the_lock_prefix_and_b1_opcode() {
        // op_ternary_reg_reg_reg(rax, r12, r11, CMPXCHG, B64, Lock) pins to
        // `F0 4D 0F B1 1C 24`.
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::OpTernaryRegRegReg,
            &[
                Operand::OpKind(Op::CompareExchange),
                Operand::Reg(gpr::RAX),
                Operand::Reg(gpr::R12),
                Operand::Reg(gpr::R11),
                Operand::Width(OpBits::B64),
            ],
            EmitFlags::LOCK,
        )
        .unwrap();
        let (code, _) = enc.finish();
        assert_eq!(code, vec![0xF0, 0x4D, 0x0F, 0xB1, 0x1C, 0x24]);
    }

    #[test]
    fn amc_load_encodes_base_index_scale_and_disp8() {
        let mut enc = X64Encoder::new(CallConvKind::C);
        enc.emit(
            MicroInstrKind::LoadAmcRegMem,
            &[
                Operand::Reg(gpr::RAX),
                Operand::Reg(gpr::RBX),
                Operand::Reg(gpr::RCX),
                Operand::ImmU64(4),
                Operand::ImmI32(8),
                Operand::Width(OpBits::B64),
            ],
            EmitFlags::ZERO,
        )
        .unwrap();
        let (code, _) = enc.finish();
        // REX.W, opcode 8B, modrm(01,000,100), sib(10,001,011), disp8(08)
        assert_eq!(code[0], 0x48);
        assert_eq!(code[1], 0x8B);
        assert_eq!(code[2], 0b01_000_100);
        assert_eq!(code[3], 0b10_001_011);
        assert_eq!(code[4], 0x08);
    }
}

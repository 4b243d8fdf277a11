//! REX/ModR/M/SIB construction shared by every x86-64 instruction form.

use crate::encoder::ByteStore;
use crate::reg::Reg;

pub fn fits_i8(value: i64) -> bool {
    (i8::MIN as i64..=i8::MAX as i64).contains(&value)
}

/// Emits a REX prefix iff one is required: `w` forces it (64-bit operand
/// size), otherwise it's needed only when an extension bit (R/X/B) is set.
pub fn emit_rex(code: &mut ByteStore, w: bool, reg: Reg, index: Option<Reg>, rm: Reg) {
    let r = reg.needs_rex_extension();
    let x = index.map(|i| i.needs_rex_extension()).unwrap_or(false);
    let b = rm.needs_rex_extension();
    if w || r || x || b {
        let byte = 0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8);
        code.push(byte);
    }
}

/// Register-direct ModR/M (`mod = 11`).
pub fn emit_modrm_reg(code: &mut ByteStore, reg_field: Reg, rm: Reg) {
    code.push(0xC0 | (reg_field.low3() << 3) | rm.low3());
}

/// `[base + disp]` with no index register. Handles the two mandatory special
/// cases: RSP/R12 as a base always need a SIB byte (`rm=100` means
/// "SIB follows", not "use RSP directly"), and RBP/R13 as a base can't use
/// `mod=00` (that encodes RIP-relative addressing instead), so a zero
/// displacement is forced into an explicit `disp8` of 0.
pub fn emit_modrm_mem(code: &mut ByteStore, reg_field: Reg, base: Reg, offset: i32) {
    let rm = base.low3();
    let needs_sib = rm == 0b100;
    let base_is_bp_like = rm == 0b101;

    if offset == 0 && !base_is_bp_like {
        code.push((reg_field.low3() << 3) | rm);
        if needs_sib {
            code.push(0x24); // scale=00, index=none(100), base=rsp/r12(100)
        }
    } else if fits_i8(offset as i64) {
        code.push(0x40 | (reg_field.low3() << 3) | rm);
        if needs_sib {
            code.push(0x24);
        }
        code.push(offset as i8 as u8);
    } else {
        code.push(0x80 | (reg_field.low3() << 3) | rm);
        if needs_sib {
            code.push(0x24);
        }
        code.extend(&offset.to_le_bytes());
    }
}

/// `[base + index*scale + disp]`. A SIB byte is always emitted since an
/// explicit index register is present.
pub fn emit_modrm_amc(code: &mut ByteStore, reg_field: Reg, base: Reg, index: Reg, scale: u32, offset: i32) {
    let scale_bits: u8 = match scale {
        1 => 0b00,
        2 => 0b01,
        4 => 0b10,
        8 => 0b11,
        other => panic!("invalid SIB scale {other}, must be 1/2/4/8"),
    };
    let base_is_bp_like = base.low3() == 0b101;

    if offset == 0 && !base_is_bp_like {
        code.push((reg_field.low3() << 3) | 0b100);
        code.push((scale_bits << 6) | (index.low3() << 3) | base.low3());
    } else if fits_i8(offset as i64) {
        code.push(0x40 | (reg_field.low3() << 3) | 0b100);
        code.push((scale_bits << 6) | (index.low3() << 3) | base.low3());
        code.push(offset as i8 as u8);
    } else {
        code.push(0x80 | (reg_field.low3() << 3) | 0b100);
        code.push((scale_bits << 6) | (index.low3() << 3) | base.low3());
        code.extend(&offset.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::gpr;

    #[test]
    fn rbp_base_with_zero_disp_forces_disp8() {
        let mut code = ByteStore::new();
        emit_modrm_mem(&mut code, gpr::RAX, gpr::RBP, 0);
        assert_eq!(code.data()[0] >> 6, 0b01);
        assert_eq!(code.data()[1], 0);
    }

    #[test]
    fn rsp_base_always_needs_sib() {
        let mut code = ByteStore::new();
        emit_modrm_mem(&mut code, gpr::RAX, gpr::RSP, 16);
        assert_eq!(code.data()[0] & 0x7, 0b100);
        assert_eq!(code.data()[1], 0x24);
    }

    #[test]
    fn amc_scale_bits_match_power_of_two() {
        let mut code = ByteStore::new();
        emit_modrm_amc(&mut code, gpr::RAX, gpr::RBX, gpr::RCX, 8, 4);
        assert_eq!(code.data()[1] >> 6, 0b11);
    }
}

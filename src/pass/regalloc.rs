//! Linear-scan register allocation.
//!
//! Grounded on the source's `MicroRegAlloc`/`RegAllocPersistentAcrossCall`
//! scenarios: virtual registers get live-interval-scanned physical
//! assignments, an interval that spans a call boundary is steered toward a
//! persistent (callee-saved) register so its value survives the call without
//! needing an explicit save/restore, and anything that doesn't fit gets
//! spilled to a stack slot using a last-use/remaining-uses/index tie-break.

use rustc_hash::FxHashMap;

use crate::callconv::CallConv;
use crate::error::{CodegenError, CodegenResult};
use crate::micro::{MicroInstr, MicroInstrBuilder, MicroInstrKind, Operand};
use crate::pass::PassContext;
use crate::reg::{OpBits, Reg, RegClass};

#[derive(Debug, Clone)]
struct Interval {
    virtual_index: u8,
    class: RegClass,
    first_def: usize,
    last_use: usize,
    use_count: u32,
    crosses_call: bool,
}

/// Where a virtual register ended up: a physical register, or a stack slot
/// (offset in machine words from the frame base, 0-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Physical(Reg),
    Spilled(u32),
}

#[derive(Debug, Default)]
pub struct RegAllocResult {
    pub assignments: FxHashMap<(RegClass, u8), Assignment>,
    pub spill_slot_count: u32,
}

impl RegAllocResult {
    pub fn assignment_for(&self, virtual_reg: Reg) -> Option<Assignment> {
        self.assignments
            .get(&(virtual_reg.class(), virtual_reg.index()))
            .copied()
    }
}

/// Dedicated scratch used to reload/store a spilled value around a single
/// use; never itself a candidate for allocation.
const SPILL_SCRATCH: Reg = crate::reg::gpr::R10;

pub struct RegAllocPass;

impl RegAllocPass {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, builder: &mut MicroInstrBuilder, ctx: &PassContext) -> CodegenResult<RegAllocResult> {
        let call_conv = CallConv::get(ctx.call_conv);
        let instrs: Vec<MicroInstr> = builder.instructions().to_vec();
        let operands = builder.operand_store().to_vec();

        let intervals = compute_intervals(&instrs, &operands);
        let result = allocate(&intervals, call_conv)?;

        let mut rebuilt = MicroInstrBuilder::new();
        rebuilt.symbols = std::mem::take(&mut builder.symbols);

        let mut index_map = vec![0u32; instrs.len() + 1];
        for (i, instr) in instrs.iter().enumerate() {
            index_map[i] = rebuilt.instructions().len() as u32;
            let ops = instr.operands(&operands);
            rewrite_instr(&mut rebuilt, instr.kind, instr.flags, ops, &result)?;
        }
        index_map[instrs.len()] = rebuilt.instructions().len() as u32;
        rebuilt.remap_patch_targets(&index_map);

        *builder = rebuilt;
        Ok(result)
    }
}

impl Default for RegAllocPass {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_intervals(instrs: &[MicroInstr], operands: &[Operand]) -> Vec<Interval> {
    let mut by_virtual: FxHashMap<(RegClass, u8), Interval> = FxHashMap::default();

    for (i, instr) in instrs.iter().enumerate() {
        let crosses = instr.kind.is_call();
        for op in instr.operands(operands) {
            if let Operand::Reg(r) = op {
                if r.is_virtual() {
                    let key = (r.class(), r.index());
                    let entry = by_virtual.entry(key).or_insert(Interval {
                        virtual_index: r.index(),
                        class: r.class(),
                        first_def: i,
                        last_use: i,
                        use_count: 0,
                        crosses_call: false,
                    });
                    entry.last_use = i;
                    entry.use_count += 1;
                }
            }
        }
        if crosses {
            for interval in by_virtual.values_mut() {
                if interval.first_def < i && interval.last_use >= i {
                    interval.crosses_call = true;
                }
            }
        }
    }

    // A second sweep: an interval's `crosses_call` must account for calls
    // that occur strictly between first_def and its eventual last_use, which
    // may not be known until later in program order than the call itself.
    let mut intervals: Vec<Interval> = by_virtual.into_values().collect();
    let call_positions: Vec<usize> = instrs
        .iter()
        .enumerate()
        .filter(|(_, instr)| instr.kind.is_call())
        .map(|(i, _)| i)
        .collect();
    for interval in intervals.iter_mut() {
        interval.crosses_call = call_positions
            .iter()
            .any(|&c| c > interval.first_def && c <= interval.last_use);
    }

    intervals.sort_by_key(|iv| iv.first_def);
    intervals
}

fn allocate(intervals: &[Interval], call_conv: &CallConv) -> CodegenResult<RegAllocResult> {
    let mut result = RegAllocResult::default();

    // Transient-first by default: a non-call-crossing interval has no reason
    // to occupy a callee-saved register, so it leaves the persistent pool
    // free for intervals that do cross a call (see `persistent_first`).
    let int_pool: Vec<Reg> = call_conv
        .int_transient_regs
        .iter()
        .chain(call_conv.int_persistent_regs.iter())
        .copied()
        .filter(|r| *r != SPILL_SCRATCH)
        .collect();
    let float_pool: Vec<Reg> = call_conv
        .float_transient_regs
        .iter()
        .chain(call_conv.float_persistent_regs.iter())
        .copied()
        .collect();

    let mut active: Vec<Interval> = Vec::new();
    let mut next_spill_slot = 0u32;

    for interval in intervals {
        active.retain(|a| a.last_use >= interval.first_def);

        let pool = match interval.class {
            RegClass::VirtualInt => &int_pool,
            RegClass::VirtualFloat => &float_pool,
            _ => return Err(CodegenError::LegalizationFailed("non-virtual register reached regalloc".into())),
        };

        let used: Vec<Reg> = active
            .iter()
            .filter_map(|a| match result.assignment_for(Reg::new(a.class, a.virtual_index)) {
                Some(Assignment::Physical(r)) => Some(r),
                _ => None,
            })
            .collect();

        let preferred_order: Vec<Reg> = if interval.crosses_call {
            persistent_first(pool, call_conv, interval.class)
        } else {
            pool.clone()
        };

        let free = preferred_order.into_iter().find(|r| !used.contains(r));

        let key = (interval.class, interval.virtual_index);
        match free {
            Some(reg) => {
                result.assignments.insert(key, Assignment::Physical(reg));
                active.push(interval.clone());
            }
            None => {
                // Spill the worst candidate among {current interval} ∪ active,
                // tie-broken by latest last_use, then most remaining uses,
                // then higher virtual index.
                let mut candidates: Vec<&Interval> = active.iter().collect();
                candidates.push(interval);
                let spill = candidates
                    .iter()
                    .max_by_key(|iv| (iv.last_use, iv.use_count, iv.virtual_index))
                    .copied()
                    .expect("candidates is non-empty");
                let spill_key = (spill.class, spill.virtual_index);

                if spill_key == key {
                    result.assignments.insert(key, Assignment::Spilled(next_spill_slot));
                    next_spill_slot += 1;
                } else {
                    // Reassign the register the spilled interval held to the
                    // current interval, and spill the evicted one instead.
                    if let Some(Assignment::Physical(freed_reg)) = result.assignments.get(&spill_key).copied() {
                        result.assignments.insert(spill_key, Assignment::Spilled(next_spill_slot));
                        next_spill_slot += 1;
                        result.assignments.insert(key, Assignment::Physical(freed_reg));
                        active.retain(|a| (a.class, a.virtual_index) != spill_key);
                        active.push(interval.clone());
                    }
                }
            }
        }
    }

    result.spill_slot_count = next_spill_slot;
    Ok(result)
}

fn persistent_first(pool: &[Reg], call_conv: &CallConv, class: RegClass) -> Vec<Reg> {
    let is_persistent = |r: &Reg| match class {
        RegClass::VirtualInt => call_conv.is_int_persistent_reg(*r),
        RegClass::VirtualFloat => call_conv.is_float_persistent_reg(*r),
        _ => false,
    };
    let mut persistent: Vec<Reg> = pool.iter().copied().filter(is_persistent).collect();
    let mut transient: Vec<Reg> = pool.iter().copied().filter(|r| !is_persistent(r)).collect();
    persistent.append(&mut transient);
    persistent
}

/// Stack-slot size in bytes; one machine word, matching `CallConv::stack_slot_size`.
const SLOT_SIZE: i32 = 8;

fn rewrite_instr(
    out: &mut MicroInstrBuilder,
    kind: MicroInstrKind,
    flags: crate::micro::EmitFlags,
    ops: &[Operand],
    result: &RegAllocResult,
) -> CodegenResult<()> {
    let mut rewritten = Vec::with_capacity(ops.len());
    let mut reload_slot: Option<u32> = None;
    let mut store_slot: Option<u32> = None;

    for op in ops {
        match op {
            Operand::Reg(r) if r.is_virtual() => match result.assignment_for(*r) {
                Some(Assignment::Physical(phys)) => rewritten.push(Operand::Reg(phys)),
                Some(Assignment::Spilled(slot)) => {
                    reload_slot = Some(slot);
                    store_slot = Some(slot);
                    rewritten.push(Operand::Reg(SPILL_SCRATCH));
                }
                None => {
                    return Err(CodegenError::LegalizationFailed(format!(
                        "virtual register {r:?} was never assigned"
                    )))
                }
            },
            other => rewritten.push(*other),
        }
    }

    if let Some(slot) = reload_slot {
        out.load_reg_mem(
            SPILL_SCRATCH,
            crate::reg::gpr::RBP,
            -(SLOT_SIZE * (slot as i32 + 1)),
            OpBits::B64,
        );
    }
    out.copy_through(kind, flags, &rewritten)?;
    if let Some(slot) = store_slot {
        out.load_mem_reg(
            crate::reg::gpr::RBP,
            -(SLOT_SIZE * (slot as i32 + 1)),
            SPILL_SCRATCH,
            OpBits::B64,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::CallConvKind;
    use crate::reg::{gpr, Reg};

    #[test]
    fn simple_virtual_registers_get_distinct_physical_assignments() {
        let mut b = MicroInstrBuilder::new();
        b.load_reg_imm(Reg::virtual_int(0), OpBits::B64, 1);
        b.load_reg_imm(Reg::virtual_int(1), OpBits::B64, 2);
        b.op_binary_reg_reg(crate::reg::Op::Add, Reg::virtual_int(0), Reg::virtual_int(1), OpBits::B64);
        let ctx = PassContext::new(CallConvKind::C);
        let result = RegAllocPass::new().run(&mut b, &ctx).unwrap();
        let a0 = result.assignment_for(Reg::virtual_int(0)).unwrap();
        let a1 = result.assignment_for(Reg::virtual_int(1)).unwrap();
        assert_ne!(a0, a1);
    }

    #[test]
    fn interval_crossing_a_call_prefers_a_persistent_register() {
        let mut b = MicroInstrBuilder::new();
        b.load_reg_imm(Reg::virtual_int(0), OpBits::B64, 7);
        b.call_extern("helper", CallConvKind::C);
        b.op_unary_reg(crate::reg::Op::Negate, Reg::virtual_int(0), OpBits::B64);
        let ctx = PassContext::new(CallConvKind::C);
        let result = RegAllocPass::new().run(&mut b, &ctx).unwrap();
        match result.assignment_for(Reg::virtual_int(0)).unwrap() {
            Assignment::Physical(reg) => {
                assert!(CallConv::get(CallConvKind::C).is_int_persistent_reg(reg));
            }
            Assignment::Spilled(_) => panic!("expected a persistent register, got a spill"),
        }
        assert_eq!(gpr::R10, SPILL_SCRATCH);
    }
}

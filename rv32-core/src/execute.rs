//! Per-opcode execution semantics: the pure state transition each decoded [`Instruction`]
//! performs against a [`Hart`]'s registers, memory, and CSRs.
//!
//! Every function here either fully commits its effect and returns `Ok(())`, or returns a
//! [`Fault`] with no partially-applied side effect beyond what the instruction's own semantics
//! already call for (e.g. a faulting load never writes `rd`).

use crate::hart::Hart;
use crate::instruction::{
    AmoOp, BranchCondition, CsrOp, Instruction, LoadWidth, RegImmOp, RegRegOp, RegShiftImmOp,
    StoreWidth,
};
use crate::privilege::{PrivilegeLevel, RawPrivilegeLevel};
use crate::registers::Specifier;
use crate::trap::{Exception, Trap};

/// What stopped an instruction from completing normally: an architectural trap, or the
/// non-architectural polite-exit sentinel raised by `CUSTOM_0` in Machine mode.
pub(crate) enum Fault {
    Trap(Trap),
    Exit,
}

impl From<Trap> for Fault {
    fn from(trap: Trap) -> Self {
        Fault::Trap(trap)
    }
}

/// Executes one decoded instruction. `raw_instruction` is only consulted for the `tval` of an
/// illegal-instruction trap raised here (decode-time illegal instructions are handled by the
/// caller, which has no decoded [`Instruction`] to dispatch on in the first place).
pub(crate) fn execute(
    hart: &mut Hart,
    instruction: Instruction,
    raw_instruction: u32,
) -> Result<(), Fault> {
    let pc = hart.registers().pc();
    let mut next_pc = pc.wrapping_add(4);
    dispatch(hart, instruction, pc, raw_instruction, &mut next_pc)?;
    *hart.registers_mut().pc_mut() = next_pc;
    Ok(())
}

fn dispatch(
    hart: &mut Hart,
    instruction: Instruction,
    pc: u32,
    raw_instruction: u32,
    next_pc: &mut u32,
) -> Result<(), Fault> {
    match instruction {
        Instruction::OpImm {
            op,
            dest,
            src,
            immediate,
        } => {
            op_imm(hart, op, dest, src, immediate);
            Ok(())
        }
        Instruction::OpShiftImm {
            op,
            dest,
            src,
            shift_amount_u5,
        } => {
            op_shift_imm(hart, op, dest, src, shift_amount_u5);
            Ok(())
        }
        Instruction::Auipc { dest, immediate } => {
            hart.registers_mut()
                .set_x(dest, pc.wrapping_add(immediate as u32));
            Ok(())
        }
        Instruction::Lui { dest, immediate } => {
            hart.registers_mut().set_x(dest, immediate as u32);
            Ok(())
        }
        Instruction::Op {
            op,
            dest,
            src1,
            src2,
        } => {
            op_reg(hart, op, dest, src1, src2);
            Ok(())
        }
        Instruction::Jal { dest, offset } => jal(hart, dest, offset, pc, next_pc),
        Instruction::Jalr { dest, base, offset } => jalr(hart, dest, base, offset, pc, next_pc),
        Instruction::Branch {
            condition,
            src1,
            src2,
            offset,
        } => branch(hart, condition, src1, src2, offset, pc, next_pc),
        Instruction::Load {
            width,
            dest,
            base,
            offset,
        } => load(hart, width, dest, base, offset),
        Instruction::Store {
            width,
            src,
            base,
            offset,
        } => store(hart, width, src, base, offset),
        Instruction::Amo {
            op,
            aq: _,
            rl: _,
            src,
            addr,
            dest,
        } => amo(hart, op, src, addr, dest),
        Instruction::Fence { .. } => Ok(()),
        Instruction::Ecall => Err(ecall(hart)),
        Instruction::Ebreak => Err(Trap::exception(Exception::Breakpoint, pc).into()),
        Instruction::Sret => sret(hart, next_pc),
        Instruction::Mret => mret(hart, next_pc),
        Instruction::Wfi => Ok(()),
        Instruction::SfenceVma { .. } => Ok(()),
        Instruction::Csr { op, dest, csr, src } => {
            let operand = hart.registers().x(src);
            let should_write = matches!(op, CsrOp::ReadWrite) || src != Specifier::X0;
            csr_rmw(hart, dest, csr, should_write, op, operand, raw_instruction)
        }
        Instruction::Csri {
            op,
            dest,
            csr,
            immediate,
        } => {
            let should_write = matches!(op, CsrOp::ReadWrite) || immediate != 0;
            csr_rmw(
                hart,
                dest,
                csr,
                should_write,
                op,
                immediate,
                raw_instruction,
            )
        }
        Instruction::CustomZero => Err(custom_zero(hart, raw_instruction)),
    }
}

fn op_imm(hart: &mut Hart, op: RegImmOp, dest: Specifier, src: Specifier, immediate: i32) {
    let a = hart.registers().x(src) as i32;
    let result = match op {
        RegImmOp::Addi => a.wrapping_add(immediate) as u32,
        RegImmOp::Slti => (a < immediate) as u32,
        RegImmOp::Sltiu => ((a as u32) < (immediate as u32)) as u32,
        RegImmOp::Xori => (a ^ immediate) as u32,
        RegImmOp::Ori => (a | immediate) as u32,
        RegImmOp::Andi => (a & immediate) as u32,
    };
    hart.registers_mut().set_x(dest, result);
}

fn op_shift_imm(
    hart: &mut Hart,
    op: RegShiftImmOp,
    dest: Specifier,
    src: Specifier,
    shamt: u32,
) {
    let a = hart.registers().x(src);
    let result = match op {
        RegShiftImmOp::Slli => a.wrapping_shl(shamt),
        RegShiftImmOp::Srli => a.wrapping_shr(shamt),
        RegShiftImmOp::Srai => (a as i32).wrapping_shr(shamt) as u32,
    };
    hart.registers_mut().set_x(dest, result);
}

fn op_reg(hart: &mut Hart, op: RegRegOp, dest: Specifier, src1: Specifier, src2: Specifier) {
    let a = hart.registers().x(src1);
    let b = hart.registers().x(src2);
    let result = match op {
        RegRegOp::Add => a.wrapping_add(b),
        RegRegOp::Sub => a.wrapping_sub(b),
        RegRegOp::Sll => a.wrapping_shl(b & 0x1F),
        RegRegOp::Slt => ((a as i32) < (b as i32)) as u32,
        RegRegOp::Sltu => (a < b) as u32,
        RegRegOp::Xor => a ^ b,
        RegRegOp::Srl => a.wrapping_shr(b & 0x1F),
        RegRegOp::Sra => (a as i32).wrapping_shr(b & 0x1F) as u32,
        RegRegOp::Or => a | b,
        RegRegOp::And => a & b,
        RegRegOp::Mul => a.wrapping_mul(b),
        RegRegOp::Mulh => (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u32,
        RegRegOp::Mulhsu => (((a as i32 as i64) * (b as i64)) >> 32) as u32,
        RegRegOp::Mulhu => (((a as u64) * (b as u64)) >> 32) as u32,
        RegRegOp::Div => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                u32::MAX
            } else if a == i32::MIN && b == -1 {
                a as u32
            } else {
                a.wrapping_div(b) as u32
            }
        }
        RegRegOp::Divu => {
            if b == 0 {
                u32::MAX
            } else {
                a / b
            }
        }
        RegRegOp::Rem => {
            let (a, b) = (a as i32, b as i32);
            if b == 0 {
                a as u32
            } else if a == i32::MIN && b == -1 {
                0
            } else {
                a.wrapping_rem(b) as u32
            }
        }
        RegRegOp::Remu => {
            if b == 0 {
                a
            } else {
                a % b
            }
        }
    };
    hart.registers_mut().set_x(dest, result);
}

fn jal(
    hart: &mut Hart,
    dest: Specifier,
    offset: i32,
    pc: u32,
    next_pc: &mut u32,
) -> Result<(), Fault> {
    let target = pc.wrapping_add(offset as u32);
    if target % 4 != 0 {
        return Err(Trap::exception(Exception::InstructionAddressMisaligned, target).into());
    }
    hart.registers_mut().set_x(dest, pc.wrapping_add(4));
    *next_pc = target;
    Ok(())
}

fn jalr(
    hart: &mut Hart,
    dest: Specifier,
    base: Specifier,
    offset: i32,
    pc: u32,
    next_pc: &mut u32,
) -> Result<(), Fault> {
    let target = hart.registers().x(base).wrapping_add(offset as u32) & !1;
    if target % 4 != 0 {
        return Err(Trap::exception(Exception::InstructionAddressMisaligned, target).into());
    }
    hart.registers_mut().set_x(dest, pc.wrapping_add(4));
    *next_pc = target;
    Ok(())
}

fn branch(
    hart: &mut Hart,
    condition: BranchCondition,
    src1: Specifier,
    src2: Specifier,
    offset: i32,
    pc: u32,
    next_pc: &mut u32,
) -> Result<(), Fault> {
    let a = hart.registers().x(src1);
    let b = hart.registers().x(src2);
    let taken = match condition {
        BranchCondition::Beq => a == b,
        BranchCondition::Bne => a != b,
        BranchCondition::Blt => (a as i32) < (b as i32),
        BranchCondition::Bltu => a < b,
        BranchCondition::Bge => (a as i32) >= (b as i32),
        BranchCondition::Bgeu => a >= b,
    };
    if taken {
        let target = pc.wrapping_add(offset as u32);
        if target % 4 != 0 {
            return Err(Trap::exception(Exception::InstructionAddressMisaligned, target).into());
        }
        *next_pc = target;
    }
    Ok(())
}

fn load(
    hart: &mut Hart,
    width: LoadWidth,
    dest: Specifier,
    base: Specifier,
    offset: i32,
) -> Result<(), Fault> {
    let va = hart.registers().x(base).wrapping_add(offset as u32);
    let (nbytes, signed): (u32, bool) = match width {
        LoadWidth::Lb => (1, true),
        LoadWidth::Lh => (2, true),
        LoadWidth::Lw => (4, true),
        LoadWidth::Lbu => (1, false),
        LoadWidth::Lhu => (2, false),
    };
    let raw = hart.load(va, nbytes)?;
    let value = if signed && nbytes < 4 {
        let shift = 32 - nbytes * 8;
        ((raw << shift) as i32 >> shift) as u32
    } else {
        raw
    };
    hart.registers_mut().set_x(dest, value);
    Ok(())
}

fn store(
    hart: &mut Hart,
    width: StoreWidth,
    src: Specifier,
    base: Specifier,
    offset: i32,
) -> Result<(), Fault> {
    let va = hart.registers().x(base).wrapping_add(offset as u32);
    let value = hart.registers().x(src);
    let nbytes: u32 = match width {
        StoreWidth::Sb => 1,
        StoreWidth::Sh => 2,
        StoreWidth::Sw => 4,
    };
    hart.store(va, nbytes, value)?;
    Ok(())
}

/// `AMO` (funct3 = 010): `LR.W`/`SC.W` go through the single-flag reservation model; the
/// remaining read-modify-write ops are atomic by construction since there is only one hart.
fn amo(
    hart: &mut Hart,
    op: AmoOp,
    src: Specifier,
    addr: Specifier,
    dest: Specifier,
) -> Result<(), Fault> {
    let va = hart.registers().x(addr);
    match op {
        AmoOp::Lr => {
            if va % 4 != 0 {
                return Err(
                    Trap::exception(Exception::StoreOrAmoAddressMisaligned, va).into(),
                );
            }
            let value = hart.load_reserved(va)?;
            hart.registers_mut().set_x(dest, value);
            Ok(())
        }
        AmoOp::Sc => {
            if va % 4 != 0 {
                return Err(
                    Trap::exception(Exception::StoreOrAmoAddressMisaligned, va).into(),
                );
            }
            if hart.take_reservation() {
                let value = hart.registers().x(src);
                hart.store(va, 4, value)?;
                hart.registers_mut().set_x(dest, 0);
            } else {
                hart.registers_mut().set_x(dest, 1);
            }
            Ok(())
        }
        _ => {
            if va % 4 != 0 {
                return Err(
                    Trap::exception(Exception::StoreOrAmoAddressMisaligned, va).into(),
                );
            }
            let operand = hart.registers().x(src);
            let old = hart.amo_rmw(va, |old| apply_amo_op(op, old, operand))?;
            hart.registers_mut().set_x(dest, old);
            Ok(())
        }
    }
}

fn apply_amo_op(op: AmoOp, old: u32, rhs: u32) -> u32 {
    match op {
        AmoOp::Swap => rhs,
        AmoOp::Add => old.wrapping_add(rhs),
        AmoOp::Xor => old ^ rhs,
        AmoOp::And => old & rhs,
        AmoOp::Or => old | rhs,
        AmoOp::Min => (old as i32).min(rhs as i32) as u32,
        AmoOp::Max => (old as i32).max(rhs as i32) as u32,
        AmoOp::Minu => old.min(rhs),
        AmoOp::Maxu => old.max(rhs),
        AmoOp::Lr | AmoOp::Sc => unreachable!("LR/SC take the reservation-flag path above"),
    }
}

fn ecall(hart: &mut Hart) -> Fault {
    let exception = match hart.csr().privilege_mode() {
        PrivilegeLevel::User => Exception::EnvironmentCallFromUMode,
        PrivilegeLevel::Supervisor => Exception::EnvironmentCallFromSMode,
        PrivilegeLevel::Machine => Exception::EnvironmentCallFromMMode,
    };
    Trap::exception(exception, 0).into()
}

/// `MRET`: restore privilege from `MPP`, restore `MIE` from `MPIE`, jump to `mepc`. Invalidates
/// the reservation set even though this profile has no hardware reason to (the architecture
/// treats any trap-return as a control transfer that clears it).
fn mret(hart: &mut Hart, next_pc: &mut u32) -> Result<(), Fault> {
    let (mpie, mpp) = {
        let status = hart.csr_mut().status_mut();
        let mpie = status.mpie();
        let mpp = status.mpp();
        status.set_mie(mpie);
        status.set_mpie(true);
        status.set_mpp(RawPrivilegeLevel::User);
        (mpie, mpp)
    };
    let _ = mpie;
    hart.csr_mut().set_privilege_mode(mpp);
    *next_pc = hart.csr().trap().mepc();
    hart.invalidate_reservation();
    Ok(())
}

/// `SRET`: mirrors [`mret`] with the S-mode register set. `mstatus.TSR` is not modeled (per
/// platform scope), so S-mode may always execute this.
fn sret(hart: &mut Hart, next_pc: &mut u32) -> Result<(), Fault> {
    let (spie, spp) = {
        let status = hart.csr_mut().status_mut();
        let spie = status.spie();
        let spp = status.spp();
        status.set_sie(spie);
        status.set_spie(true);
        status.set_spp(RawPrivilegeLevel::User);
        (spie, spp)
    };
    let _ = spie;
    hart.csr_mut().set_privilege_mode(spp);
    *next_pc = hart.csr().trap().sepc();
    hart.invalidate_reservation();
    Ok(())
}

fn csr_rmw(
    hart: &mut Hart,
    dest: Specifier,
    addr: crate::csr::CsrSpecifier,
    should_write: bool,
    op: CsrOp,
    operand: u32,
    raw_instruction: u32,
) -> Result<(), Fault> {
    let old = hart
        .csr_mut()
        .explicit_read(addr)
        .map_err(|_| illegal(raw_instruction))?;
    if should_write {
        let new = match op {
            CsrOp::ReadWrite => operand,
            CsrOp::ReadSet => old | operand,
            CsrOp::ReadClear => old & !operand,
        };
        hart.csr_mut()
            .explicit_write(addr, new)
            .map_err(|_| illegal(raw_instruction))?;
    }
    hart.registers_mut().set_x(dest, old);
    Ok(())
}

/// `CUSTOM_0` with every field zero: a polite request to exit the simulator, valid only from
/// Machine mode.
fn custom_zero(hart: &mut Hart, raw_instruction: u32) -> Fault {
    if hart.csr().privilege_mode() == PrivilegeLevel::Machine {
        Fault::Exit
    } else {
        illegal(raw_instruction)
    }
}

fn illegal(raw_instruction: u32) -> Fault {
    Trap::exception(Exception::IllegalInstruction, raw_instruction).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    fn hart_at(pc: u32) -> Hart {
        let mut hart = Hart::new(0);
        *hart.registers_mut().pc_mut() = pc;
        hart
    }

    #[test]
    fn addi_adds_and_advances_pc() {
        let mut hart = hart_at(0x1000);
        let instruction = Instruction::OpImm {
            op: RegImmOp::Addi,
            dest: Specifier::from_u5(1),
            src: Specifier::X0,
            immediate: 5,
        };
        execute(&mut hart, instruction, 0).map_err(|_| ()).unwrap();
        assert_eq!(hart.registers().x(Specifier::from_u5(1)), 5);
        assert_eq!(hart.registers().pc(), 0x1004);
    }

    #[test]
    fn div_by_zero_yields_all_ones() {
        let mut hart = hart_at(0);
        hart.registers_mut().set_x(Specifier::from_u5(1), 10);
        hart.registers_mut().set_x(Specifier::from_u5(2), 0);
        let instruction = Instruction::Op {
            op: RegRegOp::Div,
            dest: Specifier::from_u5(3),
            src1: Specifier::from_u5(1),
            src2: Specifier::from_u5(2),
        };
        execute(&mut hart, instruction, 0).map_err(|_| ()).unwrap();
        assert_eq!(hart.registers().x(Specifier::from_u5(3)), u32::MAX);
    }

    #[test]
    fn branch_to_unaligned_target_traps() {
        let mut hart = hart_at(0);
        let instruction = Instruction::Branch {
            condition: BranchCondition::Beq,
            src1: Specifier::X0,
            src2: Specifier::X0,
            offset: 2,
        };
        let err = execute(&mut hart, instruction, 0).err().unwrap();
        assert!(matches!(
            err,
            Fault::Trap(Trap {
                cause: crate::trap::Cause::Exception(Exception::InstructionAddressMisaligned),
                ..
            })
        ));
    }

    #[test]
    fn sc_without_reservation_fails_without_touching_memory() {
        let mut hart = hart_at(0);
        hart.registers_mut().set_x(Specifier::from_u5(1), 0);
        hart.registers_mut().set_x(Specifier::from_u5(2), 0xAA);
        let instruction = Instruction::Amo {
            op: AmoOp::Sc,
            aq: false,
            rl: false,
            src: Specifier::from_u5(2),
            addr: Specifier::from_u5(1),
            dest: Specifier::from_u5(3),
        };
        execute(&mut hart, instruction, 0).map_err(|_| ()).unwrap();
        assert_eq!(hart.registers().x(Specifier::from_u5(3)), 1);
        assert_eq!(hart.load(0, 4).unwrap(), 0);
    }

    #[test]
    fn lr_then_sc_round_trips() {
        let mut hart = hart_at(0);
        hart.registers_mut().set_x(Specifier::from_u5(1), 0);
        hart.registers_mut().set_x(Specifier::from_u5(2), 0x1234_5678);
        let lr = Instruction::Amo {
            op: AmoOp::Lr,
            aq: false,
            rl: false,
            src: Specifier::X0,
            addr: Specifier::from_u5(1),
            dest: Specifier::from_u5(4),
        };
        execute(&mut hart, lr, 0).map_err(|_| ()).unwrap();
        let sc = Instruction::Amo {
            op: AmoOp::Sc,
            aq: false,
            rl: false,
            src: Specifier::from_u5(2),
            addr: Specifier::from_u5(1),
            dest: Specifier::from_u5(3),
        };
        execute(&mut hart, sc, 0).map_err(|_| ()).unwrap();
        assert_eq!(hart.registers().x(Specifier::from_u5(3)), 0);
        assert_eq!(hart.load(0, 4).unwrap(), 0x1234_5678);
    }

    #[test]
    fn amo_rmw_to_misaligned_address_traps() {
        let mut hart = hart_at(0);
        hart.registers_mut().set_x(Specifier::from_u5(1), 1);
        let instruction = Instruction::Amo {
            op: AmoOp::Add,
            aq: false,
            rl: false,
            src: Specifier::from_u5(2),
            addr: Specifier::from_u5(1),
            dest: Specifier::from_u5(3),
        };
        let err = execute(&mut hart, instruction, 0).err().unwrap();
        assert!(matches!(
            err,
            Fault::Trap(Trap {
                cause: crate::trap::Cause::Exception(Exception::StoreOrAmoAddressMisaligned),
                ..
            })
        ));
    }
}

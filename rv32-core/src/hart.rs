//! The hart driver: one `tick()` fetches, decodes, and executes a single instruction, then
//! delivers any trap or pending interrupt, mirroring what real hardware does between instruction
//! retirements.
//!
//! Owns every piece of architectural state: registers, CSRs, physical memory, the single-flag
//! LR/SC reservation, and a decode cache keyed by instruction address.

use std::collections::HashMap;
use std::time::Instant;

use log::{debug, trace};

use crate::csr::CsrFile;
use crate::execute::{self, Fault};
use crate::instruction::Instruction;
use crate::memory::PhysicalMemory;
use crate::mmu::{self, AccessType, TranslationError};
use crate::privilege::{PrivilegeLevel, RawPrivilegeLevel};
use crate::registers::{Registers, Specifier};
use crate::trap::{Cause, Exception, Interrupt, Trap};

/// The word immediately preceding a semihosting `EBREAK`: `slli x0, x0, 0x1F`.
const SEMIHOSTING_PROLOGUE: u32 = 0x01F0_1013;
/// The word immediately following a semihosting `EBREAK`: `srai x0, x0, 0x7`.
const SEMIHOSTING_EPILOGUE: u32 = 0x4070_5013;

/// What one [`Hart::tick`] accomplished.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Tick {
    /// An instruction retired (or trapped into a handler; either way the hart is still running).
    Retired,
    /// `CUSTOM_0` was executed in Machine mode: the guest is asking to stop.
    Exited,
}

/// A single RISC-V hart: registers, CSRs, and the physical memory it's wired to.
#[derive(Debug)]
pub struct Hart {
    registers: Registers,
    csr: CsrFile,
    memory: PhysicalMemory,
    reservation: bool,
    icache: HashMap<u32, (u32, Instruction)>,
}

impl Hart {
    /// A hart reset to its initial state: PC at `reset_vector`, Machine mode, empty reservation
    /// and decode cache.
    pub fn new(reset_vector: u32) -> Self {
        Self {
            registers: Registers::new(reset_vector),
            csr: CsrFile::new(),
            memory: PhysicalMemory::new(),
            reservation: false,
            icache: HashMap::new(),
        }
    }

    pub fn reset(&mut self, reset_vector: u32) {
        self.registers = Registers::new(reset_vector);
        self.csr = CsrFile::new();
        self.memory.reset();
        self.reservation = false;
        self.icache.clear();
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn csr(&self) -> &CsrFile {
        &self.csr
    }

    pub fn csr_mut(&mut self) -> &mut CsrFile {
        &mut self.csr
    }

    /// Physical memory, for image loaders to populate before the hart starts running.
    pub fn memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    /// Best-effort debug-only read: translates and reads one byte at a time, so `buf` needn't be
    /// a power-of-two width or aligned. Used only by the optional remote-debug interface.
    pub fn debug_read(&mut self, va: u32, buf: &mut [u8]) -> Result<(), Trap> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = va.wrapping_add(i as u32);
            let pa = self.translate_exc(AccessType::Load, addr)?;
            let mut b = [0u8; 1];
            self.memory
                .read(pa, &mut b, &self.csr)
                .map_err(|_| Trap::exception(Exception::LoadAccessFault, addr))?;
            *byte = b[0];
        }
        Ok(())
    }

    /// Debug-only counterpart to [`Hart::debug_read`].
    pub fn debug_write(&mut self, va: u32, data: &[u8]) -> Result<(), Trap> {
        for (i, &byte) in data.iter().enumerate() {
            let addr = va.wrapping_add(i as u32);
            let pa = self.translate_exc(AccessType::Store, addr)?;
            self.memory
                .write(pa, &[byte], &mut self.csr)
                .map_err(|_| Trap::exception(Exception::StoreOrAmoAccessFault, addr))?;
        }
        Ok(())
    }

    /// Retires (or traps on) one instruction.
    pub fn tick(&mut self) -> Tick {
        self.memory.poll_devices();
        self.csr.increment_mcycle();

        let pc = self.registers.pc();
        let outcome = match self.fetch_decode(pc) {
            Err(fault) => Err(fault),
            Ok((instruction, raw)) => {
                self.csr.increment_minstret();
                let retires = !matches!(instruction, Instruction::Ecall | Instruction::Ebreak);
                let invalidates_icache = instruction_invalidates_icache(instruction);
                let result = execute::execute(self, instruction, raw);
                let trapped = matches!(result, Err(Fault::Trap(_)));
                if !retires || trapped {
                    self.csr.decrement_minstret();
                }
                if invalidates_icache && result.is_ok() {
                    trace!("icache invalidated by {instruction:?}");
                    self.icache.clear();
                }
                result
            }
        };

        match outcome {
            Ok(()) => {}
            Err(Fault::Exit) => return Tick::Exited,
            Err(Fault::Trap(trap)) => {
                self.icache.clear();
                self.reservation = false;
                self.deliver_trap(trap);
            }
        }

        self.csr.occasional_update_timer(Instant::now());

        if let Some(interrupt) = self.highest_priority_interrupt() {
            self.icache.clear();
            self.reservation = false;
            self.deliver_trap(Trap::interrupt(interrupt));
        }

        Tick::Retired
    }

    /// Looks up `pc` in the decode cache, falling back to a physical fetch and decode on a miss.
    /// `MISC-MEM`/`SYSTEM`-opcode instructions are never installed: executing one invalidates the
    /// whole cache anyway, so caching it first would be wasted work.
    fn fetch_decode(&mut self, pc: u32) -> Result<(Instruction, u32), Fault> {
        if let Some(&(raw, instruction)) = self.icache.get(&pc) {
            return Ok((instruction, raw));
        }
        let raw = self.fetch_word(pc)?;
        let instruction =
            Instruction::decode(raw).map_err(|_| Trap::exception(Exception::IllegalInstruction, raw))?;
        if !instruction_invalidates_icache(instruction) {
            self.icache.insert(pc, (raw, instruction));
        }
        Ok((instruction, raw))
    }

    fn translate_exc(&mut self, access: AccessType, va: u32) -> Result<u64, Trap> {
        let memory = &mut self.memory;
        let csr = &self.csr;
        let privilege = csr.privilege_mode();
        mmu::translate(csr, privilege, access, va, |pa| {
            let mut buf = [0u8; 4];
            memory
                .read(pa, &mut buf, csr)
                .map(|_| u32::from_le_bytes(buf))
                .map_err(|_| ())
        })
        .map_err(|err| Trap::exception(exception_for(access, err), va))
    }

    pub(crate) fn load(&mut self, va: u32, width: u32) -> Result<u32, Trap> {
        if va % width != 0 {
            return Err(Trap::exception(Exception::LoadAddressMisaligned, va));
        }
        let pa = self.translate_exc(AccessType::Load, va)?;
        let mut buf = [0u8; 4];
        self.memory
            .read(pa, &mut buf[..width as usize], &self.csr)
            .map_err(|_| Trap::exception(Exception::LoadAccessFault, va))?;
        Ok(u32::from_le_bytes(buf))
    }

    pub(crate) fn store(&mut self, va: u32, width: u32, value: u32) -> Result<(), Trap> {
        if va % width != 0 {
            return Err(Trap::exception(Exception::StoreOrAmoAddressMisaligned, va));
        }
        let pa = self.translate_exc(AccessType::Store, va)?;
        let bytes = value.to_le_bytes();
        self.memory
            .write(pa, &bytes[..width as usize], &mut self.csr)
            .map_err(|_| Trap::exception(Exception::StoreOrAmoAccessFault, va))?;
        Ok(())
    }

    pub(crate) fn fetch_word(&mut self, va: u32) -> Result<u32, Trap> {
        if va % 4 != 0 {
            return Err(Trap::exception(Exception::InstructionAddressMisaligned, va));
        }
        let pa = self.translate_exc(AccessType::Fetch, va)?;
        let mut buf = [0u8; 4];
        self.memory
            .read(pa, &mut buf, &self.csr)
            .map_err(|_| Trap::exception(Exception::InstructionAccessFault, va))?;
        Ok(u32::from_le_bytes(buf))
    }

    /// `LR.W`'s memory phase: sets the reservation flag on success. Alignment is the caller's
    /// responsibility (it raises `StoreOrAmoAddressMisaligned`, not `LoadAddressMisaligned`, since
    /// the whole `AMO` group shares that classification).
    pub(crate) fn load_reserved(&mut self, va: u32) -> Result<u32, Trap> {
        let pa = self.translate_exc(AccessType::Load, va)?;
        let mut buf = [0u8; 4];
        self.memory
            .read(pa, &mut buf, &self.csr)
            .map_err(|_| Trap::exception(Exception::LoadAccessFault, va))?;
        self.reservation = true;
        Ok(u32::from_le_bytes(buf))
    }

    /// A generic atomic read-modify-write, used by every `AMO` op except `LR.W`/`SC.W`. Single
    /// hart, so "atomic" just means no hart-visible state changes between the read and the write.
    pub(crate) fn amo_rmw(
        &mut self,
        va: u32,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<u32, Trap> {
        let pa = self.translate_exc(AccessType::Store, va)?;
        let mut buf = [0u8; 4];
        self.memory
            .read(pa, &mut buf, &self.csr)
            .map_err(|_| Trap::exception(Exception::StoreOrAmoAccessFault, va))?;
        let old = u32::from_le_bytes(buf);
        let new = f(old);
        self.memory
            .write(pa, &new.to_le_bytes(), &mut self.csr)
            .map_err(|_| Trap::exception(Exception::StoreOrAmoAccessFault, va))?;
        Ok(old)
    }

    pub(crate) fn take_reservation(&mut self) -> bool {
        std::mem::replace(&mut self.reservation, false)
    }

    pub(crate) fn invalidate_reservation(&mut self) {
        self.reservation = false;
    }

    /// The narrow semihosting call this platform recognizes: an `EBREAK` sandwiched between
    /// `slli x0, x0, 0x1F` and `srai x0, x0, 0x7` writes the byte at the address in `a1` to host
    /// stdout instead of trapping.
    fn try_semihosting_putchar(&mut self) -> bool {
        let pc = self.registers.pc();
        let (Ok(before), Ok(after)) = (
            self.fetch_word(pc.wrapping_sub(4)),
            self.fetch_word(pc.wrapping_add(4)),
        ) else {
            return false;
        };
        if before != SEMIHOSTING_PROLOGUE || after != SEMIHOSTING_EPILOGUE {
            return false;
        }
        let addr = self.registers.x(Specifier::from_u5(11)); // a1
        if let Ok(byte) = self.load(addr, 1) {
            print!("{}", byte as u8 as char);
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
        *self.registers.pc_mut() = pc.wrapping_add(4);
        true
    }

    /// Delivers `trap`: picks Machine or Supervisor according to the delegation registers,
    /// records the cause/epc/tval, and jumps to the handler (applying vectored mode for
    /// interrupts only, per the architecture).
    fn deliver_trap(&mut self, trap: Trap) {
        if matches!(trap.cause, Cause::Exception(Exception::Breakpoint)) && self.try_semihosting_putchar()
        {
            return;
        }

        let pc = self.registers.pc();
        let privilege = self.csr.privilege_mode();
        let delegated = match trap.cause {
            Cause::Exception(e) => (self.csr.medeleg() >> e.code()) & 1 != 0,
            Cause::Interrupt(i) => (self.csr.mideleg() >> i.code()) & 1 != 0,
        };
        let to_s_mode = privilege != PrivilegeLevel::Machine && delegated;
        let cause = trap.cause.encode();
        let vectored_offset = match trap.cause {
            Cause::Interrupt(i) => 4 * i.code(),
            Cause::Exception(_) => 0,
        };

        debug!("trap {cause:#x} at pc={pc:#x}, delivered to {}", if to_s_mode { "S" } else { "M" });

        if to_s_mode {
            self.csr.trap_mut().set_sepc(pc);
            self.csr.trap_mut().set_scause(cause);
            self.csr.trap_mut().set_stval(trap.tval);
            let stvec = self.csr.stvec();
            let target = trap_target(stvec, vectored_offset);
            *self.registers.pc_mut() = target;

            let status = self.csr.status_mut();
            let sie = status.sie();
            status.set_spie(sie);
            status.set_sie(false);
            status.set_spp(RawPrivilegeLevel::from(privilege));
            self.csr.set_privilege_mode(PrivilegeLevel::Supervisor);
        } else {
            self.csr.trap_mut().set_mepc(pc);
            self.csr.trap_mut().set_mcause(cause);
            self.csr.trap_mut().set_mtval(trap.tval);
            let mtvec = self.csr.mtvec();
            let target = trap_target(mtvec, vectored_offset);
            *self.registers.pc_mut() = target;

            let status = self.csr.status_mut();
            let mie = status.mie();
            status.set_mpie(mie);
            status.set_mie(false);
            status.set_mpp(RawPrivilegeLevel::from(privilege));
            self.csr.set_privilege_mode(PrivilegeLevel::Machine);
        }
    }

    /// The highest-priority pending, locally and globally enabled interrupt, in the order
    /// `Interrupt::PRIORITY_ORDER` names: MEI, MSI, MTI, SEI, SSI, STI.
    fn highest_priority_interrupt(&self) -> Option<Interrupt> {
        let mip = self.csr.mip();
        let mie = self.csr.mie();
        let mideleg = self.csr.mideleg();
        let privilege = self.csr.privilege_mode();
        let status = self.csr.status();

        Interrupt::PRIORITY_ORDER.into_iter().find(|&interrupt| {
            let bit = 1 << interrupt.code();
            if mip & bit == 0 || mie & bit == 0 {
                return false;
            }
            if mideleg & bit != 0 {
                match privilege {
                    PrivilegeLevel::Machine => false,
                    PrivilegeLevel::Supervisor => status.sie(),
                    PrivilegeLevel::User => true,
                }
            } else {
                match privilege {
                    PrivilegeLevel::Machine => status.mie(),
                    _ => true,
                }
            }
        })
    }
}

fn instruction_invalidates_icache(instruction: Instruction) -> bool {
    matches!(
        instruction,
        Instruction::Fence { .. }
            | Instruction::Ecall
            | Instruction::Ebreak
            | Instruction::Sret
            | Instruction::Mret
            | Instruction::Wfi
            | Instruction::SfenceVma { .. }
            | Instruction::Csr { .. }
            | Instruction::Csri { .. }
    )
}

/// `{m,s}tvec`'s base (bits 31..2, `mode`-independent) plus the interrupt vector offset if
/// `mode == 1` (vectored). Exceptions always use the base regardless of mode.
fn trap_target(tvec: u32, vectored_offset: u32) -> u32 {
    let base = tvec & !0b11;
    if tvec & 0b11 == 1 {
        base.wrapping_add(vectored_offset)
    } else {
        base
    }
}

fn exception_for(access: AccessType, err: TranslationError) -> Exception {
    match (access, err) {
        (AccessType::Fetch, TranslationError::AccessFault) => Exception::InstructionAccessFault,
        (AccessType::Fetch, TranslationError::PageFault) => Exception::InstructionPageFault,
        (AccessType::Load, TranslationError::AccessFault) => Exception::LoadAccessFault,
        (AccessType::Load, TranslationError::PageFault) => Exception::LoadPageFault,
        (AccessType::Store, TranslationError::AccessFault) => Exception::StoreOrAmoAccessFault,
        (AccessType::Store, TranslationError::PageFault) => Exception::StoreOrAmoPageFault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::MTVEC;

    #[test]
    fn unimplemented_instruction_traps_to_illegal_instruction() {
        let mut hart = Hart::new(0);
        hart.memory_mut().load_image(0, &0x0000_0000u32.to_le_bytes());
        let tick = hart.tick();
        assert_eq!(tick, Tick::Retired);
        assert_eq!(hart.csr().trap().mcause(), Exception::IllegalInstruction.code());
    }

    #[test]
    fn addi_retires_and_advances_pc() {
        let mut hart = Hart::new(0);
        // addi x1, x0, 5
        let raw: u32 = (5 << 20) | (0 << 15) | (0b000 << 12) | (1 << 7) | 0b0010011;
        hart.memory_mut().load_image(0, &raw.to_le_bytes());
        assert_eq!(hart.tick(), Tick::Retired);
        assert_eq!(hart.registers().x(Specifier::from_u5(1)), 5);
        assert_eq!(hart.registers().pc(), 4);
        assert_eq!(hart.csr().minstret(), 1);
    }

    #[test]
    fn ecall_traps_to_machine_mode_handler() {
        let mut hart = Hart::new(0);
        hart.csr_mut().implicit_write(MTVEC, 0x8000_0000).unwrap();
        // ecall
        let raw: u32 = 0b1110011;
        hart.memory_mut().load_image(0, &raw.to_le_bytes());
        hart.tick();
        assert_eq!(hart.registers().pc(), 0x8000_0000);
        assert_eq!(
            hart.csr().trap().mcause(),
            Exception::EnvironmentCallFromMMode.code()
        );
        assert_eq!(hart.csr().minstret(), 0);
    }

    #[test]
    fn custom_zero_in_machine_mode_exits() {
        let mut hart = Hart::new(0);
        let raw: u32 = 0b00_010_11;
        hart.memory_mut().load_image(0, &raw.to_le_bytes());
        assert_eq!(hart.tick(), Tick::Exited);
        // CUSTOM_0 retires like any other instruction; only ECALL/EBREAK roll minstret back.
        assert_eq!(hart.csr().minstret(), 1);
    }
}

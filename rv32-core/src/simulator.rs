//! The public front-end API: construct a hart from a list of memory images, then drive it one
//! instruction (or one run) at a time.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::hart::{Hart, Tick};
use crate::loader::{self, LoadError};

/// Where a freshly constructed hart starts fetching. User firmware and kernel images alike are
/// linked to be entered here.
pub const RESET_VECTOR: u32 = 0;

#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Why [`Simulator::run_until`] stopped.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RunOutcome {
    /// `minstret` reached the requested count without the hart exiting.
    ReachedCount,
    /// The hart retired a `CUSTOM_0` exit instruction before the count was reached.
    Exited,
}

/// Owns a single [`Hart`] and the image root relative paths are resolved against.
pub struct Simulator {
    hart: Hart,
}

impl Simulator {
    /// Resets a hart to [`RESET_VECTOR`] and loads every image in `paths`, in order, into it.
    /// Bare relative paths (no directory component) are resolved under `image_root`; anything
    /// else is used as-is. Construction fails at the first image that can't be read or parsed.
    pub fn new(
        image_root: impl AsRef<Path>,
        paths: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Result<Self, ConstructionError> {
        let image_root: PathBuf = image_root.as_ref().to_path_buf();
        let mut hart = Hart::new(RESET_VECTOR);
        for path in paths {
            loader::load_image(hart.memory_mut(), &image_root, path.as_ref())?;
        }
        Ok(Self { hart })
    }

    /// Executes a single decode/execute cycle. See [`Hart::tick`].
    pub fn tick(&mut self) -> Tick {
        self.hart.tick()
    }

    /// Ticks until `minstret` reaches `inst_count`, or the hart exits. An `inst_count` of `0`
    /// means "run until exit", since `minstret` starting at (and frequently returning to, on
    /// overflow) `0` would otherwise stop the run before it begins.
    pub fn run_until(&mut self, inst_count: u64) -> RunOutcome {
        loop {
            if inst_count != 0 && self.hart.csr().minstret() >= inst_count {
                return RunOutcome::ReachedCount;
            }
            if self.tick() == Tick::Exited {
                return RunOutcome::Exited;
            }
        }
    }

    /// The number of instructions retired so far (`minstret`).
    pub fn get_inst_count(&self) -> u64 {
        self.hart.csr().minstret()
    }

    pub fn hart(&self) -> &Hart {
        &self.hart
    }

    pub fn hart_mut(&mut self) -> &mut Hart {
        &mut self.hart
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    use crate::csr::SATP;
    use crate::privilege::PrivilegeLevel;
    use crate::registers::Specifier;
    use crate::trap::Exception;

    fn write_temp_vhex(contents: &[u8]) -> (TempDir, String) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.hex");
        std::fs::File::create(&path).unwrap().write_all(contents).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        (dir, name)
    }

    #[test]
    fn run_until_zero_runs_to_exit() {
        let (dir, name) = write_temp_vhex(b"@00000000 0000000B"); // CUSTOM_0 at address 0
        let mut sim = Simulator::new(dir.path(), [name]).unwrap();
        assert_eq!(sim.run_until(0), RunOutcome::Exited);
    }

    #[test]
    fn construction_fails_on_missing_image() {
        let err = Simulator::new(".", ["definitely-does-not-exist.hex"]);
        assert!(err.is_err());
    }

    // The six scenarios below drive a bare `Hart` directly rather than `Simulator`, so each can
    // poke registers/CSRs/memory before the first tick without round-tripping through an image
    // file. `Simulator` itself is a thin wrapper over exactly this loop (see `tick`/`run_until`
    // above), so exercising `Hart` here covers the same ground.

    fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
        ((imm as u32 & 0xFFF) << 20) | ((rs1 as u32) << 15) | ((rd as u32) << 7) | 0b0010011
    }

    fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
        ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | ((rd as u32) << 7) | 0b0110011
    }

    const CUSTOM_0_EXIT: u32 = 0b000_1011;

    #[test]
    fn scenario_infinite_add_loop_exits_at_4097_retirements() {
        let mut hart = Hart::new(0);
        let add_two_to_x31 = addi(31, 31, 2);
        let mut image = Vec::with_capacity(4096 * 4 + 4);
        for _ in 0..4096 {
            image.extend_from_slice(&add_two_to_x31.to_le_bytes());
        }
        image.extend_from_slice(&CUSTOM_0_EXIT.to_le_bytes());
        hart.memory_mut().load_image(0, &image);

        loop {
            if hart.tick() == Tick::Exited {
                break;
            }
        }

        assert_eq!(hart.csr().minstret(), 4097);
        assert_eq!(hart.registers().pc(), 0x4000);
        assert_eq!(hart.registers().x(Specifier::from_u5(31)), 8192);
    }

    #[test]
    fn scenario_auipc() {
        let mut hart = Hart::new(0);
        let nop = addi(0, 0, 0);
        // auipc x31, 1: U-type immediate field occupies bits 31:12 directly.
        let auipc_x31_1 = (1u32 << 12) | (31 << 7) | 0b0010111;
        let mut image = Vec::new();
        image.extend_from_slice(&nop.to_le_bytes());
        image.extend_from_slice(&nop.to_le_bytes());
        image.extend_from_slice(&nop.to_le_bytes());
        image.extend_from_slice(&auipc_x31_1.to_le_bytes());
        image.extend_from_slice(&CUSTOM_0_EXIT.to_le_bytes());
        hart.memory_mut().load_image(0, &image);

        loop {
            if hart.tick() == Tick::Exited {
                break;
            }
        }

        assert_eq!(hart.csr().minstret(), 5);
        assert_eq!(hart.registers().pc(), 0x10);
        assert_eq!(hart.registers().x(Specifier::from_u5(31)), (1 << 12) + 0xC);
    }

    #[test]
    fn scenario_fibonacci_via_jalr() {
        let mut hart = Hart::new(0);
        // Setup: x29 = 0, x30 = 1, x31 = 0.
        let mut image = Vec::new();
        image.extend_from_slice(&addi(29, 0, 0).to_le_bytes()); // 0x0
        image.extend_from_slice(&addi(30, 0, 1).to_le_bytes()); // 0x4
        image.extend_from_slice(&addi(31, 0, 0).to_le_bytes()); // 0x8
        // Loop body (entered at 0xC): x31 = x29 + x30; x29 = x30; x30 = x31; jump back to 0xC.
        image.extend_from_slice(&add(31, 29, 30).to_le_bytes()); // 0xC
        image.extend_from_slice(&addi(29, 30, 0).to_le_bytes()); // 0x10
        image.extend_from_slice(&addi(30, 31, 0).to_le_bytes()); // 0x14
        let jalr_back_to_loop_start = (0xCu32 << 20) | 0b1100111; // jalr x0, x0, 0xC
        image.extend_from_slice(&jalr_back_to_loop_start.to_le_bytes()); // 0x18
        hart.memory_mut().load_image(0, &image);

        // 3 setup instructions, then 47 iterations of the 4-instruction loop body: the 47th
        // Fibonacci number is the largest that still fits in 32 bits.
        for _ in 0..3 + 47 * 4 {
            assert_eq!(hart.tick(), Tick::Retired);
        }

        assert_eq!(hart.registers().x(Specifier::from_u5(31)), 2_971_215_073);
    }

    #[test]
    fn scenario_store_byte_then_load_word() {
        let mut hart = Hart::new(0);
        // sb x2, 12(x1); lw x3, 12(x1) — x1 and x2 are both 0 at reset, so this stores the low
        // byte of x2 (0x00) to address 12 and reads the word back.
        let sb_x2_12_x1 = (0u32 << 25) | (2 << 20) | (1 << 15) | (12 << 7) | 0b0100011;
        let lw_x3_12_x1 = (12u32 << 20) | (1 << 15) | (0b010 << 12) | (3 << 7) | 0b0000011;
        let mut image = Vec::new();
        image.extend_from_slice(&sb_x2_12_x1.to_le_bytes());
        image.extend_from_slice(&lw_x3_12_x1.to_le_bytes());
        hart.memory_mut().load_image(0, &image);
        hart.memory_mut().load_image(12, &0x89ABCDEFu32.to_le_bytes());

        assert_eq!(hart.tick(), Tick::Retired); // sb
        assert_eq!(hart.tick(), Tick::Retired); // lw
        assert_eq!(hart.registers().x(Specifier::from_u5(3)), 0x89AB_CD00);
    }

    #[test]
    fn scenario_illegal_instruction_trap() {
        let mut hart = Hart::new(0);
        hart.memory_mut().load_image(0, &0u32.to_le_bytes());

        assert_eq!(hart.tick(), Tick::Retired);
        assert_eq!(hart.csr().trap().mcause(), Exception::IllegalInstruction.code());
        assert_eq!(hart.csr().trap().mtval(), 0);
        assert_eq!(hart.csr().trap().mepc(), 0);
        assert_eq!(hart.csr().trap().mcause() & 0x8000_0000, 0);
    }

    #[test]
    fn scenario_sv32_identity_superpage() {
        let mut hart = Hart::new(0);
        hart.csr_mut().set_privilege_mode(PrivilegeLevel::Supervisor);
        // satp.MODE = Sv32, PPN = 1: the root page table lives at physical page 1.
        hart.csr_mut()
            .implicit_write(SATP, (1 << 31) | 1)
            .unwrap();

        let va: u32 = 0x003C_0FF0;
        let vpn1 = va >> 22; // 0, so both the program (pc 0) and `va` share one root PTE.
        // Leaf superpage PTE: V,R,W,X,A,D set, U clear, PPN1 == VPN1, PPN0 == 0.
        let entry = 0b1100_1111 | (vpn1 << 20);
        hart.memory_mut().load_image(0x1000, &entry.to_le_bytes());
        hart.memory_mut().load_image(va as u64, &0xDEAD_BEEFu32.to_le_bytes());

        hart.registers_mut().set_x(Specifier::from_u5(1), va);
        let lw_x5_0_x1 = (0u32 << 20) | (1 << 15) | (0b010 << 12) | (5 << 7) | 0b0000011;
        hart.memory_mut().load_image(0, &lw_x5_0_x1.to_le_bytes());

        assert_eq!(hart.tick(), Tick::Retired);
        assert_eq!(hart.registers().x(Specifier::from_u5(5)), 0xDEAD_BEEF);
    }
}

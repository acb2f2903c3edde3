//! A single-hart RV32IMA_Zicsr_Zifencei simulator: decode/execute loop, M/S/U privilege modes,
//! Sv32 paging, and the small set of platform peripherals (ACLINT timer, UART, debug sink) needed
//! to boot supervisor-mode firmware.
//!
//! [`simulator::Simulator`] is the front door: construct one from a list of memory images, then
//! drive it with [`simulator::Simulator::tick`] or [`simulator::Simulator::run_until`].

#[macro_use]
extern crate static_assertions;

pub mod csr;
pub mod execute;
pub mod hart;
pub mod instruction;
pub mod loader;
pub mod memory;
pub mod mmu;
pub mod privilege;
pub mod registers;
pub mod resources;
pub mod simulator;
pub mod status;
pub mod trap;
pub mod word;

pub use hart::Hart;
pub use privilege::PrivilegeLevel;
pub use simulator::Simulator;

//! The physical memory map: dispatches a 34-bit physical address to the resource it belongs to
//! (main memory, the ACLINT timer aliases, the UART, or the debug sink), or reports that nothing
//! is mapped there.

use crate::csr::CsrFile;
use crate::resources::aclint;
use crate::resources::debug_sink::DebugSink;
use crate::resources::ram::Ram;
use crate::resources::uart::Uart;

pub const USER_RAM_BASE: u64 = 0x0_0000_0000;
pub const USER_RAM_SIZE: u64 = 0x0400_0000; // 64 MiB

pub const KERNEL_RAM_BASE: u64 = 0x0_C000_0000;
pub const KERNEL_RAM_SIZE: u64 = 0x0400_0000; // 64 MiB

pub const TIMER_BASE: u64 = 0x0_FFFF_FFE0;

pub const UART_BASE: u64 = 0x0_FFFF_FFF0;

pub const DEBUG_SINK_ADDRESS: u64 = 0x0_FFFF_FFFF;

/// Why a physical access couldn't be completed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessFault {
    /// No resource is mapped at this address.
    Unmapped,
    /// A resource is mapped here, but doesn't support this width or alignment (e.g. a 4-byte
    /// access to the single-byte debug sink).
    Unsupported,
}

/// The physical address space: two RAM regions, the machine-timer aliases, a UART, and a debug
/// sink. Everything else is unmapped.
#[derive(Debug)]
pub struct PhysicalMemory {
    user_ram: Ram,
    kernel_ram: Ram,
    uart: Uart,
    debug_sink: DebugSink,
}

impl PhysicalMemory {
    pub fn new() -> Self {
        Self {
            user_ram: Ram::new(USER_RAM_SIZE as usize),
            kernel_ram: Ram::new(KERNEL_RAM_SIZE as usize),
            uart: Uart::new(),
            debug_sink: DebugSink::new(),
        }
    }

    pub fn reset(&mut self) {
        self.user_ram.reset();
        self.kernel_ram.reset();
        self.uart = Uart::new();
        self.debug_sink = DebugSink::new();
    }

    /// Called once per tick so the UART's RX register reflects freshly available host input.
    pub fn poll_devices(&mut self) {
        self.uart.poll_input();
    }

    /// Loads `data` into main memory at a physical `base_address`, as used by image loaders.
    /// Bytes that fall outside a writable RAM region are silently ignored, same as a guest store
    /// to an unmapped address would be (except no trap is raised: there is no hart yet).
    pub fn load_image(&mut self, base_address: u64, data: &[u8]) {
        let mut csr = CsrFile::new();
        for (i, &byte) in data.iter().enumerate() {
            let address = base_address + i as u64;
            let _ = self.write(address, &[byte], &mut csr);
        }
    }

    /// Only the timer-alias region touches `csr`, and only for reading; this never needs a
    /// mutable borrow, which lets a page-table walk hold `csr` immutably for its whole duration
    /// while also reading physical memory through it.
    pub fn read(&mut self, address: u64, buf: &mut [u8], csr: &CsrFile) -> Result<(), AccessFault> {
        match region(address) {
            Region::UserRam => read_ram(&self.user_ram, address - USER_RAM_BASE, buf),
            Region::KernelRam => read_ram(&self.kernel_ram, address - KERNEL_RAM_BASE, buf),
            Region::Timer => read_timer(csr, address - TIMER_BASE, buf),
            Region::Uart => read_uart(&mut self.uart, address - UART_BASE, buf),
            Region::DebugSink => Err(AccessFault::Unsupported), // write-only
            Region::Unmapped => Err(AccessFault::Unmapped),
        }
    }

    pub fn write(&mut self, address: u64, buf: &[u8], csr: &mut CsrFile) -> Result<(), AccessFault> {
        match region(address) {
            Region::UserRam => write_ram(&mut self.user_ram, address - USER_RAM_BASE, buf),
            Region::KernelRam => write_ram(&mut self.kernel_ram, address - KERNEL_RAM_BASE, buf),
            Region::Timer => write_timer(csr, address - TIMER_BASE, buf),
            Region::Uart => write_uart(&mut self.uart, address - UART_BASE, buf),
            Region::DebugSink => write_debug_sink(&mut self.debug_sink, buf),
            Region::Unmapped => Err(AccessFault::Unmapped),
        }
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Region {
    UserRam,
    KernelRam,
    Timer,
    Uart,
    DebugSink,
    Unmapped,
}

fn region(address: u64) -> Region {
    if (USER_RAM_BASE..USER_RAM_BASE + USER_RAM_SIZE).contains(&address) {
        Region::UserRam
    } else if (KERNEL_RAM_BASE..KERNEL_RAM_BASE + KERNEL_RAM_SIZE).contains(&address) {
        Region::KernelRam
    } else if (TIMER_BASE..TIMER_BASE + aclint::SIZE as u64).contains(&address) {
        Region::Timer
    } else if (UART_BASE..UART_BASE + crate::resources::uart::SIZE as u64).contains(&address) {
        Region::Uart
    } else if address == DEBUG_SINK_ADDRESS {
        Region::DebugSink
    } else {
        Region::Unmapped
    }
}

fn read_ram(ram: &Ram, offset: u64, buf: &mut [u8]) -> Result<(), AccessFault> {
    let start = offset as usize;
    if start + buf.len() > ram.len() {
        return Err(AccessFault::Unmapped);
    }
    ram.read(buf, offset as u32);
    Ok(())
}

fn write_ram(ram: &mut Ram, offset: u64, buf: &[u8]) -> Result<(), AccessFault> {
    let start = offset as usize;
    if start + buf.len() > ram.len() {
        return Err(AccessFault::Unmapped);
    }
    ram.write(offset as u32, buf);
    Ok(())
}

/// The timer aliases only support word-aligned, word-wide access.
fn read_timer(csr: &CsrFile, offset: u64, buf: &mut [u8]) -> Result<(), AccessFault> {
    if buf.len() != 4 || offset % 4 != 0 {
        return Err(AccessFault::Unsupported);
    }
    match aclint::read(csr, offset as u32) {
        Some(value) => {
            buf.copy_from_slice(&value.to_le_bytes());
            Ok(())
        }
        None => Err(AccessFault::Unsupported),
    }
}

fn write_timer(csr: &mut CsrFile, offset: u64, buf: &[u8]) -> Result<(), AccessFault> {
    if buf.len() != 4 || offset % 4 != 0 {
        return Err(AccessFault::Unsupported);
    }
    let value = u32::from_le_bytes(buf.try_into().unwrap());
    match aclint::write(csr, offset as u32, value) {
        Some(()) => Ok(()),
        None => Err(AccessFault::Unsupported),
    }
}

/// The UART is byte-only: unaligned or wider access is an access-fault.
fn read_uart(uart: &mut Uart, offset: u64, buf: &mut [u8]) -> Result<(), AccessFault> {
    if buf.len() != 1 {
        return Err(AccessFault::Unsupported);
    }
    buf[0] = uart.read(offset as u32);
    Ok(())
}

fn write_uart(uart: &mut Uart, offset: u64, buf: &[u8]) -> Result<(), AccessFault> {
    if buf.len() != 1 {
        return Err(AccessFault::Unsupported);
    }
    uart.write(offset as u32, buf[0]);
    Ok(())
}

fn write_debug_sink(sink: &mut DebugSink, buf: &[u8]) -> Result<(), AccessFault> {
    if buf.len() != 1 {
        return Err(AccessFault::Unsupported);
    }
    sink.write(buf[0]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ram_round_trips() {
        let mut mem = PhysicalMemory::new();
        let mut csr = CsrFile::new();
        mem.write(0x10, &[1, 2, 3, 4], &mut csr).unwrap();
        let mut buf = [0u8; 4];
        mem.read(0x10, &mut buf, &csr).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn unmapped_address_is_a_fault() {
        let mut mem = PhysicalMemory::new();
        let mut csr = CsrFile::new();
        let mut buf = [0u8; 4];
        assert_eq!(
            mem.read(0x0_8000_0000, &mut buf, &csr),
            Err(AccessFault::Unmapped)
        );
    }

    #[test]
    fn debug_sink_rejects_wide_access() {
        let mut mem = PhysicalMemory::new();
        let mut csr = CsrFile::new();
        assert_eq!(
            mem.write(DEBUG_SINK_ADDRESS, &[1, 2], &mut csr),
            Err(AccessFault::Unsupported)
        );
    }

    #[test]
    fn timer_alias_round_trips_through_csr_file() {
        let mut mem = PhysicalMemory::new();
        let mut csr = CsrFile::new();
        mem.write(TIMER_BASE + 8, &0x1234_5678u32.to_le_bytes(), &mut csr)
            .unwrap(); // MTIMECMP
        assert_eq!(csr.read_mtimecmp(), 0x1234_5678);
    }
}

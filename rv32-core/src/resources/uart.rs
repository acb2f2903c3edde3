//! A 16550-compatible UART, as a single-byte (no FIFO) register model.
//!
//! `red-planet-core`'s own UART keeps a 16-byte FIFO in each direction and raises an interrupt
//! line through a callback. That shape only pays for itself once you model a real serial
//! transport; `lib/uart.cpp` in the original implementation this simulator is descended from gets
//! away with a single-byte, non-blocking register and no interrupt wiring at all, and so does
//! this one. RHR reads never block: an interrupt-pending register is still present since guest
//! software probes it, but nothing outside this module ever sets bits in it.

use std::io::Read;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use bitvec::order::Lsb0;
use bitvec::view::BitView;

pub const RHR: u32 = 0;
pub const THR: u32 = 0;
pub const IER: u32 = 1;
pub const ISR: u32 = 2;
pub const FCR: u32 = 2;
pub const LCR: u32 = 3;
pub const MCR: u32 = 4;
pub const LSR: u32 = 5;
pub const MSR: u32 = 6;
pub const SPR: u32 = 7;

/// Size of the byte-wide register block this module claims in the physical address map.
pub const SIZE: u32 = 8;

mod lsr_idx {
    pub const DR: usize = 0; // Data Ready
    pub const OE: usize = 1; // Overrun Error
    pub const THRE: usize = 5; // Transmitter Holding Register Empty
    pub const TEMT: usize = 6; // Transmitter Empty
}

/// A non-blocking source of bytes typed in at the host terminal.
///
/// Reading from [`std::io::Stdin`] directly blocks the calling thread until a byte arrives, which
/// would stall the entire simulator whenever guest software polls an empty RHR. A background
/// thread drains stdin into a channel instead, so [`Uart::read`] only ever does a non-blocking
/// `try_recv`.
#[derive(Debug)]
struct StdinSource {
    rx: Receiver<u8>,
}

impl StdinSource {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut byte = [0u8; 1];
            let mut stdin = std::io::stdin();
            while stdin.read_exact(&mut byte).is_ok() {
                if tx.send(byte[0]).is_err() {
                    break;
                }
            }
        });
        Self { rx }
    }

    fn try_next(&self) -> Option<u8> {
        match self.rx.try_recv() {
            Ok(byte) => Some(byte),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// A 16550-compatible UART with a single-byte RX/TX register (no FIFO), matching the reduced
/// model this simulator's UART was grounded on.
#[derive(Debug)]
pub struct Uart {
    ier: u8,
    isr: u8,
    lcr: u8,
    lsr: u8,
    msr: u8,
    mcr: u8,
    spr: u8,
    dll: u8,
    dlm: u8,

    rx_holding: Option<u8>,
    stdin: StdinSource,
    tx_line: String,
}

impl Uart {
    pub fn new() -> Self {
        Self {
            ier: 0x00,
            isr: 0x01, // no interrupt pending
            lcr: 0x03,
            lsr: Self::reset_lsr(),
            msr: 0x00,
            mcr: 0x00,
            spr: 0x00,
            dll: 0x00,
            dlm: 0x00,
            rx_holding: None,
            stdin: StdinSource::new(),
            tx_line: String::new(),
        }
    }

    fn reset_lsr() -> u8 {
        let mut lsr: u8 = 0;
        lsr.view_bits_mut::<Lsb0>().set(lsr_idx::THRE, true);
        lsr.view_bits_mut::<Lsb0>().set(lsr_idx::TEMT, true);
        lsr
    }

    fn dlab(&self) -> bool {
        self.lcr & (1 << 7) != 0
    }

    /// Pulls any newly available host-input byte into the holding register. Called once per tick
    /// so that LSR's Data Ready bit reflects availability before guest software polls it.
    pub fn poll_input(&mut self) {
        if self.rx_holding.is_none() {
            if let Some(byte) = self.stdin.try_next() {
                self.rx_holding = Some(byte);
                self.lsr.view_bits_mut::<Lsb0>().set(lsr_idx::DR, true);
            }
        }
    }

    /// Reads a byte-wide register. `offset` must already be known to fall inside [`SIZE`].
    pub fn read(&mut self, offset: u32) -> u8 {
        match offset {
            RHR if self.dlab() => self.dll,
            RHR => self.read_rhr(),
            IER if self.dlab() => self.dlm,
            IER => self.ier,
            ISR => self.isr,
            LCR => self.lcr,
            MCR => self.mcr, // write-only in hardware, but harmless to read back
            LSR => self.read_lsr(),
            MSR => self.msr,
            SPR => self.spr,
            _ => 0xFF,
        }
    }

    fn read_rhr(&mut self) -> u8 {
        match self.rx_holding.take() {
            Some(byte) => {
                self.lsr.view_bits_mut::<Lsb0>().set(lsr_idx::DR, false);
                byte
            }
            // Reading an empty RHR is not modeled by the reference this UART follows; return 0.
            None => 0,
        }
    }

    fn read_lsr(&mut self) -> u8 {
        let value = self.lsr;
        self.lsr.view_bits_mut::<Lsb0>().set(lsr_idx::OE, false);
        value
    }

    /// Writes a byte-wide register. See [`read`](Self::read) for the contract on `offset`.
    pub fn write(&mut self, offset: u32, value: u8) {
        match offset {
            THR if self.dlab() => self.dll = value,
            THR => self.write_thr(value),
            IER if self.dlab() => self.dlm = value,
            IER => self.ier = value,
            FCR => {} // no FIFO to reset
            LCR => self.lcr = value,
            MCR => self.mcr = value,
            LSR | MSR => {} // read-only
            SPR => self.spr = value,
            _ => {}
        }
    }

    fn write_thr(&mut self, value: u8) {
        match value {
            b'\n' => {
                log::info!(target: "uart", "{}", self.tx_line);
                self.tx_line.clear();
            }
            b'\0' => {}
            byte => self.tx_line.push(byte as char),
        }
    }
}

impl Default for Uart {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsr_starts_with_no_data_ready() {
        let mut uart = Uart::new();
        assert_eq!(uart.read(LSR) & 1, 0);
    }

    #[test]
    fn divisor_latch_is_accessible_behind_dlab() {
        let mut uart = Uart::new();
        uart.write(LCR, 1 << 7); // set DLAB
        uart.write(THR, 0x12); // really DLL
        uart.write(IER, 0x34); // really DLM
        assert_eq!(uart.read(RHR), 0x12);
        assert_eq!(uart.read(IER), 0x34);
    }

    #[test]
    fn injected_byte_sets_data_ready_and_is_consumed_once() {
        let mut uart = Uart::new();
        uart.rx_holding = Some(b'A');
        uart.lsr.view_bits_mut::<Lsb0>().set(lsr_idx::DR, true);
        assert_eq!(uart.read(LSR) & 1, 1);
        assert_eq!(uart.read(RHR), b'A');
        assert_eq!(uart.read(LSR) & 1, 0);
    }
}

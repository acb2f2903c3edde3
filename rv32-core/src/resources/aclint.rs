//! The machine-timer CSR aliases: `mtime`/`mtimeh`/`mtimecmp`/`mtimecmph` exposed as four
//! consecutive physical words, layered directly over the timer state already kept in
//! [`CsrFile`](crate::csr::CsrFile).
//!
//! A real ACLINT exposes `MTIME`/`MTIMEH` at offsets `0xBFF8`/`0xBFFC` and `MTIMECMP`/`MTIMECMPH`
//! at `0x4000`/`0x4004` within a much larger device window (only one hart's timecmp is
//! implemented here, same as upstream). This profile condenses that down to four consecutive
//! words at the top of the address space; only the condensed offsets below are recognized.

use crate::csr::CsrFile;

pub const MTIME: u32 = 0x0;
pub const MTIMEH: u32 = 0x4;
pub const MTIMECMP: u32 = 0x8;
pub const MTIMECMPH: u32 = 0xC;

/// Size of the block this module claims in the physical address map.
pub const SIZE: u32 = 0x10;

/// Reads a word from the timer block. `offset` must already be known to fall inside `SIZE`.
///
/// Returns `None` for any access that isn't a word-aligned, word-wide access to one of the four
/// recognized offsets — the physical memory dispatcher turns that into an access fault.
pub fn read(csr: &CsrFile, offset: u32) -> Option<u32> {
    match offset {
        MTIME => Some(csr.read_mtime()),
        MTIMEH => Some(csr.read_mtimeh()),
        MTIMECMP => Some(csr.read_mtimecmp()),
        MTIMECMPH => Some(csr.read_mtimecmph()),
        _ => None,
    }
}

/// Writes a word to the timer block. See [`read`] for the contract on `offset`.
pub fn write(csr: &mut CsrFile, offset: u32, value: u32) -> Option<()> {
    match offset {
        MTIME => csr.write_mtime(value),
        MTIMEH => csr.write_mtimeh(value),
        MTIMECMP => csr.write_mtimecmp(value),
        MTIMECMPH => csr.write_mtimecmph(value),
        _ => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtimecmp_round_trips() {
        let mut csr = CsrFile::new();
        write(&mut csr, MTIMECMP, 0xABCD_1234).unwrap();
        write(&mut csr, MTIMECMPH, 0x0000_0001).unwrap();
        assert_eq!(read(&csr, MTIMECMP), Some(0xABCD_1234));
        assert_eq!(read(&csr, MTIMECMPH), Some(0x0000_0001));
    }

    #[test]
    fn mtime_read_after_write_is_exact() {
        let mut csr = CsrFile::new();
        write(&mut csr, MTIME, 1234).unwrap();
        assert_eq!(read(&csr, MTIME), Some(1234));
    }

    #[test]
    fn unrecognized_offset_is_none() {
        let csr = CsrFile::new();
        assert_eq!(read(&csr, 0x2), None);
    }
}

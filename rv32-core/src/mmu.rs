//! The Sv32 memory-management unit: translates a 32-bit virtual address into a 34-bit physical
//! address.
//!
//! Diverges from the reference this crate was grounded on in one respect: A/D bits are only
//! *checked*, never written back by hardware. Software must set them itself; an unset A, or an
//! unset D on a store, page-faults instead of being silently fixed up.

use crate::csr::CsrFile;
use crate::privilege::PrivilegeLevel;

/// The three kinds of memory access the MMU translates on behalf of.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    Fetch,
    Load,
    Store,
}

/// Why translation failed. The caller maps this to the access-kind-specific exception (e.g.
/// [`AccessType::Load`] + [`TranslationError::AccessFault`] becomes `LoadAccessFault`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TranslationError {
    AccessFault,
    PageFault,
}

mod pte {
    pub const V: usize = 0;
    pub const R: usize = 1;
    pub const W: usize = 2;
    pub const X: usize = 3;
    pub const U: usize = 4;
    pub const A: usize = 6;
    pub const D: usize = 7;

    pub fn bit(entry: u32, i: usize) -> bool {
        (entry >> i) & 1 != 0
    }

    /// `PPN[0]`: bits 19..10.
    pub fn ppn0(entry: u32) -> u32 {
        (entry >> 10) & 0x3FF
    }

    /// `PPN[1]`: bits 31..20.
    pub fn ppn1(entry: u32) -> u32 {
        entry >> 20
    }

    /// Full 22-bit PPN.
    pub fn ppn(entry: u32) -> u32 {
        entry >> 10
    }
}

/// `satp.MODE`: `0` = Bare, `1` = Sv32.
fn satp_is_sv32(satp: u32) -> bool {
    satp >> 31 == 1
}

fn satp_ppn(satp: u32) -> u32 {
    satp & 0x3F_FFFF
}

/// Decides whether `va` must be translated at all, given the current privilege and `mstatus`.
fn effective_privilege(
    current_privilege: PrivilegeLevel,
    access: AccessType,
    mprv: bool,
    mpp: PrivilegeLevel,
) -> PrivilegeLevel {
    if access == AccessType::Fetch {
        current_privilege
    } else if mprv {
        mpp
    } else {
        current_privilege
    }
}

/// Translates `va`, calling `read_pte` to fetch each page-table entry (a physical word read; the
/// caller routes this through the physical memory dispatcher). Returns the 34-bit physical
/// address as a `u64`.
pub fn translate(
    csr: &CsrFile,
    current_privilege: PrivilegeLevel,
    access: AccessType,
    va: u32,
    mut read_pte: impl FnMut(u64) -> Result<u32, ()>,
) -> Result<u64, TranslationError> {
    let mprv = csr.status().mprv();
    let mpp = csr.status().mpp();
    let effective = effective_privilege(current_privilege, access, mprv, mpp);

    if effective == PrivilegeLevel::Machine || !satp_is_sv32(csr.satp()) {
        return Ok(va as u64);
    }

    let vpn = [(va >> 12) & 0x3FF, (va >> 22) & 0x3FF]; // vpn[0], vpn[1]

    let mut a = satp_ppn(csr.satp()) as u64 * 4096;
    let mut level: i32 = 1;
    let entry = loop {
        let pte_addr = a + (vpn[level as usize] as u64) * 4;
        let entry = read_pte(pte_addr).map_err(|_| TranslationError::AccessFault)?;

        if !pte::bit(entry, pte::V) || (!pte::bit(entry, pte::R) && pte::bit(entry, pte::W)) {
            return Err(TranslationError::PageFault);
        }
        if pte::bit(entry, pte::R) || pte::bit(entry, pte::X) {
            break entry; // leaf
        }
        // Non-leaf: descend.
        a = pte::ppn(entry) as u64 * 4096;
        level -= 1;
        if level < 0 {
            return Err(TranslationError::PageFault);
        }
    };

    check_permissions(csr, current_privilege, mprv, mpp, access, entry)?;

    if level == 1 && pte::ppn0(entry) != 0 {
        return Err(TranslationError::PageFault); // misaligned superpage
    }

    if pte::bit(entry, pte::A) == false || (access == AccessType::Store && !pte::bit(entry, pte::D)) {
        return Err(TranslationError::PageFault);
    }

    let offset = va & 0xFFF;
    let pa = if level == 1 {
        (pte::ppn1(entry) as u64) << 22 | (vpn[0] as u64) << 12 | offset as u64
    } else {
        (pte::ppn(entry) as u64) << 12 | offset as u64
    };
    Ok(pa)
}

fn check_permissions(
    csr: &CsrFile,
    current_privilege: PrivilegeLevel,
    mprv: bool,
    mpp: PrivilegeLevel,
    access: AccessType,
    entry: u32,
) -> Result<(), TranslationError> {
    let r = pte::bit(entry, pte::R);
    let w = pte::bit(entry, pte::W);
    let x = pte::bit(entry, pte::X);
    let u = pte::bit(entry, pte::U);
    let mxr = csr.status().mxr();
    let sum = csr.status().sum();

    if access == AccessType::Fetch && !x {
        return Err(TranslationError::PageFault);
    }
    if access == AccessType::Store && !w {
        return Err(TranslationError::PageFault);
    }
    if access == AccessType::Load && !r && !(mxr && x) {
        return Err(TranslationError::PageFault);
    }

    let accessing_as_supervisor = current_privilege == PrivilegeLevel::Supervisor
        || (access != AccessType::Fetch && mpp == PrivilegeLevel::Supervisor && mprv);
    if accessing_as_supervisor && !sum && u {
        return Err(TranslationError::PageFault);
    }
    if current_privilege == PrivilegeLevel::User && !u {
        return Err(TranslationError::PageFault);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_mapped_csr() -> CsrFile {
        let mut csr = CsrFile::new();
        csr.implicit_write(crate::csr::SATP, 1 << 31).unwrap();
        csr
    }

    #[test]
    fn bare_mode_is_identity() {
        let csr = CsrFile::new(); // satp.MODE == 0 (Bare)
        let pa = translate(
            &csr,
            PrivilegeLevel::Supervisor,
            AccessType::Load,
            0x8000_1234,
            |_| unreachable!("Bare mode must not read any PTE"),
        )
        .unwrap();
        assert_eq!(pa, 0x8000_1234);
    }

    #[test]
    fn identity_superpage_round_trips() {
        let csr = identity_mapped_csr();
        let va: u32 = 0x003C_0FF0;
        let vpn1 = va >> 22;
        // Leaf superpage PTE: V,R,W,X,A,D set, U clear, PPN1 == VPN1, PPN0 == 0.
        let entry = 0b1100_1111 | (vpn1 << 20);
        let pa = translate(&csr, PrivilegeLevel::Supervisor, AccessType::Load, va, |_| {
            Ok(entry)
        })
        .unwrap();
        assert_eq!(pa, va as u64);
    }

    #[test]
    fn missing_accessed_bit_page_faults() {
        let csr = identity_mapped_csr();
        let va: u32 = 0x003C_0FF0;
        let vpn1 = va >> 22;
        let entry = 0b1000_1111 | (vpn1 << 20); // A bit (6) clear
        let result = translate(&csr, PrivilegeLevel::Supervisor, AccessType::Load, va, |_| {
            Ok(entry)
        });
        assert_eq!(result, Err(TranslationError::PageFault));
    }
}

//! `mstatus`/`mstatush`/`sstatus`: only the bits this profile actually models.
//!
//! Per the architectural state this simulator implements, only MIE, SIE, MPIE, SPIE, MPP, SPP,
//! MPRV, SUM and MXR carry meaning; every other `mstatus`/`mstatush` bit (FS/XS/SD, UBE/SBE/MBE,
//! TVM/TW/TSR, ...) reads as zero and ignores writes.

use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::privilege::{PrivilegeLevel, RawPrivilegeLevel};

/// Mask of the `mstatus` bits visible through `sstatus`.
const SSTATUS_MASK: u32 = (1 << idx::SIE) | (1 << idx::SPIE) | (1 << idx::SPP) | (1 << idx::SUM) | (1 << idx::MXR);

/// Holds `mstatus`. `mstatush` is not separately stored: this profile never sets any of its bits,
/// so reads of it are always zero and writes are no-ops.
#[derive(Debug, Clone, Default)]
pub struct Status {
    mstatus: u32,
}

impl Status {
    pub fn new() -> Self {
        Self { mstatus: 0 }
    }

    pub fn mie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MIE]
    }

    pub fn set_mie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MIE, value);
    }

    pub fn sie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SIE]
    }

    pub fn set_sie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SIE, value);
    }

    pub fn mpie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPIE]
    }

    pub fn set_mpie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPIE, value);
    }

    pub fn spie(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SPIE]
    }

    pub fn set_spie(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SPIE, value);
    }

    /// The MPP field is **WARL**: it can only hold a privilege level that actually exists.
    pub fn mpp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(self.mstatus.view_bits::<Lsb0>()[idx::MPP..(idx::MPP + 2)].load_le())
            .try_into()
            .unwrap_or(PrivilegeLevel::User)
    }

    pub fn set_mpp(&mut self, value: RawPrivilegeLevel) {
        let Ok(value) = PrivilegeLevel::try_from(value) else {
            return; // WARL: ignore the reserved encoding.
        };
        self.mstatus.view_bits_mut::<Lsb0>()[idx::MPP..(idx::MPP + 2)].store_le(value as u8);
    }

    /// The SPP field is **WARL** and restricted to User/Supervisor.
    pub fn spp(&self) -> PrivilegeLevel {
        RawPrivilegeLevel::from_u2(self.mstatus.view_bits::<Lsb0>()[idx::SPP] as u8)
            .try_into()
            .unwrap_or(PrivilegeLevel::User)
    }

    pub fn set_spp(&mut self, value: RawPrivilegeLevel) {
        if let Ok(value @ (PrivilegeLevel::User | PrivilegeLevel::Supervisor)) = PrivilegeLevel::try_from(value) {
            self.mstatus
                .view_bits_mut::<Lsb0>()
                .set(idx::SPP, value as u8 != 0);
        }
    }

    pub fn mprv(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MPRV]
    }

    pub fn set_mprv(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MPRV, value);
    }

    pub fn mxr(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::MXR]
    }

    pub fn set_mxr(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::MXR, value);
    }

    pub fn sum(&self) -> bool {
        self.mstatus.view_bits::<Lsb0>()[idx::SUM]
    }

    pub fn set_sum(&mut self, value: bool) {
        self.mstatus.view_bits_mut::<Lsb0>().set(idx::SUM, value);
    }

    pub fn mstatus(&self) -> u32 {
        self.mstatus
    }

    /// Applies a masked write to `mstatus`, routing each modeled field through its WARL setter.
    pub fn write_mstatus(&mut self, value: u32, mask: u32) {
        let mask_bits = mask.view_bits::<Lsb0>();
        let updated = self.mstatus & !mask | value & mask;
        let updated_bits = updated.view_bits::<Lsb0>();

        if mask_bits[idx::MIE] {
            self.set_mie(updated_bits[idx::MIE]);
        }
        if mask_bits[idx::SIE] {
            self.set_sie(updated_bits[idx::SIE]);
        }
        if mask_bits[idx::MPIE] {
            self.set_mpie(updated_bits[idx::MPIE]);
        }
        if mask_bits[idx::SPIE] {
            self.set_spie(updated_bits[idx::SPIE]);
        }
        if mask_bits[idx::SPP] {
            self.set_spp(RawPrivilegeLevel::from_u2(updated_bits[idx::SPP] as u8));
        }
        if mask_bits[idx::MPP] || mask_bits[idx::MPP + 1] {
            self.set_mpp(RawPrivilegeLevel::from_u2(
                updated_bits[idx::MPP..(idx::MPP + 2)].load_le(),
            ));
        }
        if mask_bits[idx::MPRV] {
            self.set_mprv(updated_bits[idx::MPRV]);
        }
        if mask_bits[idx::SUM] {
            self.set_sum(updated_bits[idx::SUM]);
        }
        if mask_bits[idx::MXR] {
            self.set_mxr(updated_bits[idx::MXR]);
        }
        // Every other bit is unmodeled and stays zero.
    }

    pub fn read_sstatus(&self) -> u32 {
        self.mstatus & SSTATUS_MASK
    }

    pub fn write_sstatus(&mut self, value: u32, mask: u32) {
        self.write_mstatus(value, mask & SSTATUS_MASK);
    }
}

mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mpp_is_warl() {
        let mut status = Status::new();
        status.set_mpp(RawPrivilegeLevel::Reserved);
        assert_eq!(status.mpp(), PrivilegeLevel::User);
        status.set_mpp(RawPrivilegeLevel::Machine);
        assert_eq!(status.mpp(), PrivilegeLevel::Machine);
    }

    #[test]
    fn sstatus_is_a_masked_view() {
        let mut status = Status::new();
        status.write_mstatus(u32::MAX, u32::MAX);
        let sstatus = status.read_sstatus();
        assert_eq!(sstatus, SSTATUS_MASK);
    }

    #[test]
    fn spp_rejects_machine() {
        let mut status = Status::new();
        status.set_spp(RawPrivilegeLevel::Machine);
        assert_eq!(status.spp(), PrivilegeLevel::User);
    }
}

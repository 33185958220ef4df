//! Memory-mapped access to the device's register windows.

use core::ptr::{read_volatile, write_volatile};

use vmxnet3_common::DriverError;
use vmxnet3_hal::{DeviceRegisters, PciHandle};

use crate::regs::bar;

/// The two mapped BARs of a vmxnet3 function.
///
/// All accesses are volatile 32-bit loads and stores; the compiler may
/// neither coalesce nor reorder them. CPU-visible ordering against the
/// device is handled by explicit fences at the call sites.
#[derive(Debug)]
pub struct MappedBars {
    /// VD window base (virtual = physical in identity-mapped memory).
    vd_base: usize,
    /// PT window base.
    pt_base: usize,
}

// SAFETY: The register windows are fixed hardware addresses; 32-bit MMIO
// accesses are atomic at the bus level and need no further serialization.
unsafe impl Send for MappedBars {}
unsafe impl Sync for MappedBars {}

impl MappedBars {
    /// Resolve the PT and VD windows from the device's BARs.
    pub fn map(pci: &dyn PciHandle) -> Result<MappedBars, DriverError> {
        let pt_base = pci.bar(bar::PT).ok_or(DriverError::BadBar)? as usize;
        let vd_base = pci.bar(bar::VD).ok_or(DriverError::BadBar)? as usize;
        Ok(MappedBars { vd_base, pt_base })
    }
}

impl DeviceRegisters for MappedBars {
    fn vd_read(&self, offset: u32) -> u32 {
        // SAFETY: the BAR covers the whole VD window; volatile is required
        // for MMIO.
        unsafe { read_volatile((self.vd_base + offset as usize) as *const u32) }
    }

    fn vd_write(&self, offset: u32, value: u32) {
        // SAFETY: as in `vd_read`.
        unsafe { write_volatile((self.vd_base + offset as usize) as *mut u32, value) }
    }

    fn pt_write(&self, offset: u32, value: u32) {
        // SAFETY: the BAR covers the whole PT window.
        unsafe { write_volatile((self.pt_base + offset as usize) as *mut u32, value) }
    }
}

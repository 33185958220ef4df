//! vmxnet3 register layout and wire-level constants.
//!
//! The device exposes two 32-bit register windows through PCI BARs: the
//! "virtual device" (VD) window for commands and configuration, and the
//! "pass-through" (PT) window for interrupt masks and producer doorbells.
//!
//! # References
//!
//! - VMware vmxnet3 virtual device specification (rev 1)
//! - Linux and iPXE vmxnet3 drivers

use bitflags::bitflags;

/// VMware PCI vendor ID.
pub const PCI_VENDOR_VMWARE: u16 = 0x15AD;

/// vmxnet3 PCI product ID.
pub const PCI_PRODUCT_VMXNET3: u16 = 0x07B0;

/// Supported PCI revision.
pub const REVISION_ID: u8 = 0x1;

/// BAR indices of the two register windows and the MSI-X table.
pub mod bar {
    /// Pass-through window (doorbells, interrupt masks).
    pub const PT: u8 = 0;
    /// Virtual device window (commands, configuration).
    pub const VD: u8 = 1;
    /// MSI-X table.
    pub const MSIX: u8 = 2;
}

/// VD window register offsets.
pub mod vd {
    /// Supported device revisions (read), revision select (write).
    pub const REVISION: u32 = 0x00;
    /// Supported UPT versions (read), version select (write).
    pub const UPT_VERSION: u32 = 0x08;
    /// Shared-area bus address, low half (write).
    pub const SHARED_LO: u32 = 0x10;
    /// Shared-area bus address, high half (write).
    pub const SHARED_HI: u32 = 0x18;
    /// Command register; write a command, read back its status.
    pub const CMD: u32 = 0x20;
    /// MAC address bytes 0..4.
    pub const MAC_LO: u32 = 0x28;
    /// MAC address bytes 4..6 in the low half.
    pub const MAC_HI: u32 = 0x30;
    /// Event cause register; write back to acknowledge.
    pub const ECR: u32 = 0x40;
}

/// PT window register offsets.
pub mod pt {
    /// Interrupt mask base; one register per vector, stride 8.
    /// 0 enables the vector, 1 masks it.
    pub const IMR: u32 = 0x000;
    /// TX producer doorbell.
    pub const TXPROD: u32 = 0x600;
    /// RX ring 0 producer doorbell base, stride 8 per ring id.
    pub const RXPROD0: u32 = 0x800;
    /// RX ring 1 producer doorbell base, stride 8 per ring id.
    pub const RXPROD1: u32 = 0xA00;
}

/// Device commands.
///
/// The two ranges are distinct: "set" commands count up from 0xcafe0000,
/// "get" commands from 0xf00d0000. The numeric order within each range is
/// part of the device ABI and must not be rearranged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Activate the device with the configured shared area.
    ActivateDev = 0xcafe_0000,
    /// Quiesce all queues.
    QuiesceDev,
    /// Reset the device.
    ResetDev,
    /// Apply the RX filter mode from the shared area.
    UpdateRxMode,
    /// Apply the MAC filter table.
    UpdateMacFilters,
    /// Apply the VLAN filter table.
    UpdateVlanFilters,
    /// Apply the RSS indirection table.
    UpdateRssidt,
    /// Apply interrupt moderation levels.
    UpdateIml,
    /// Apply power management configuration.
    UpdatePmcfg,
    /// Apply feature selection.
    UpdateFeature,
    /// Load a device plugin.
    LoadPlugin,

    /// Query per-queue status.
    GetQueueStatus = 0xf00d_0000,
    /// Query device statistics.
    GetStats,
    /// Query link state; bit 0 = up, upper 16 bits = speed in Mbps.
    GetLink,
    /// Permanent MAC address, low half.
    GetPermMacLo,
    /// Permanent MAC address, high half.
    GetPermMacHi,
    /// Device ID, low half.
    GetDidLo,
    /// Device ID, high half.
    GetDidHi,
    /// Extra device information.
    GetDevExtraInfo,
    /// Configured interrupt information.
    GetConfIntr,
}

/// Shared-area magic cookie.
pub const REV1_MAGIC: u32 = 0xbabe_fee1;

/// Driver version magic written into the shared area.
pub const VERSION_MAGIC: u32 = 0x6950_5845;

/// Required alignment of the DMA area.
pub const DMA_ALIGN: usize = 512;

/// Largest supported buffer size.
pub const MAX_BUFFER_LEN: usize = 0x4000;

/// Generation flag in an RX descriptor.
pub const RXF_GEN: u32 = 0x8000_0000;
/// Generation flag in an RX completion entry.
pub const RXCF_GEN: u32 = 0x8000_0000;
/// Generation flag in a TX descriptor (bit 14 of flags word 0).
pub const TXF_GEN: u32 = 0x0000_4000;
/// Generation flag in a TX completion entry.
pub const TXCF_GEN: u32 = 0x8000_0000;
/// End-of-packet flag in a TX descriptor.
pub const TXF_EOP: u32 = 0x0000_1000;
/// Request-completion flag in a TX descriptor.
pub const TXF_CQ: u32 = 0x0000_2000;

/// Guest architecture codes for the shared area.
pub const GOS_BITS_32: u32 = 1;
/// 64-bit guest architecture code.
pub const GOS_BITS_64: u32 = 2;
/// "Linux-like" guest type code.
pub const GOS_TYPE_LINUX: u32 = 1;

/// Adaptive interrupt moderation level.
pub const IML_ADAPTIVE: u8 = 8;
/// Number of moderation slots in the shared area.
pub const MAX_INTRS: usize = 25;
/// Automatic interrupt masking mode.
pub const IT_AUTO: u8 = 0;
/// Automatic interrupt moderation mode.
pub const IMM_AUTO: u8 = 0;

bitflags! {
    /// Bits of the event cause register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventCause: u32 {
        /// An RX queue reported an error.
        const RXQ_ERROR   = 0x1;
        /// A TX queue reported an error.
        const TXQ_ERROR   = 0x2;
        /// Device woke from a low-power state; link may have changed.
        const DEVICE_WAKE = 0x4;
        /// Link state changed.
        const LINK_CHANGE = 0x8;
    }
}

bitflags! {
    /// RX filter modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxFilterMode: u32 {
        /// Accept unicast frames to our MAC.
        const UCAST     = 0x01;
        /// Accept filtered multicast frames.
        const MCAST     = 0x02;
        /// Accept broadcast frames.
        const BCAST     = 0x04;
        /// Accept all multicast frames.
        const ALL_MULTI = 0x08;
        /// Accept everything.
        const PROMISC   = 0x10;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ranges() {
        assert_eq!(Command::ActivateDev as u32, 0xcafe_0000);
        assert_eq!(Command::ResetDev as u32, 0xcafe_0002);
        assert_eq!(Command::LoadPlugin as u32, 0xcafe_000a);
        assert_eq!(Command::GetQueueStatus as u32, 0xf00d_0000);
        assert_eq!(Command::GetLink as u32, 0xf00d_0002);
        assert_eq!(Command::GetConfIntr as u32, 0xf00d_0008);
    }

    #[test]
    fn test_doorbell_offsets() {
        assert_eq!(pt::TXPROD, 0x600);
        assert_eq!(pt::RXPROD0 + 8, 0x808);
        assert_eq!(pt::RXPROD1, 0xA00);
    }
}

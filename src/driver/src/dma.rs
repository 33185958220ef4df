//! The DMA area shared with the device.
//!
//! A single allocation, aligned to [`DMA_ALIGN`](crate::regs::DMA_ALIGN),
//! holds every structure the device reads or writes: the TX descriptor and
//! completion rings, each RX queue's descriptor pair and completion ring,
//! the queue descriptors, and the shared info block. Regions are arranged
//! in order of decreasing alignment so one allocation covers all of them.
//!
//! Descriptor and completion entries are written and read with volatile
//! accesses; the device is an independent agent racing on this memory.

use core::alloc::Layout;
use core::ptr::{addr_of_mut, NonNull};

use crate::regs::{RXCF_GEN, TXCF_GEN};

/// Number of TX descriptors.
pub const NUM_TX_DESC: usize = 128;
/// Number of TX completion entries.
pub const NUM_TX_COMP: usize = NUM_TX_DESC;
/// Capacity of RX descriptor ring 0.
pub const NUM_RX_DESC0: usize = 1024;
/// Capacity of RX descriptor ring 1.
pub const NUM_RX_DESC1: usize = 256;
/// Capacity of an RX completion ring.
pub const NUM_RX_COMP: usize = NUM_RX_DESC0 + NUM_RX_DESC1;
/// Number of RX queues.
pub const NUM_RX_QUEUES: usize = 1;

/// A TX descriptor: buffer address plus two flag words.
///
/// Flags word 0 carries the 14-bit length and the generation bit; flags
/// word 1 carries the end-of-packet and request-completion bits.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TxDesc {
    /// Bus address of the frame data.
    pub address: u64,
    /// Flag words 0 and 1.
    pub flags: [u32; 2],
}

/// A TX completion entry written by the device.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TxComp {
    /// Index of the last completed TX descriptor.
    pub index: u32,
    /// Reserved words.
    pub rsvd: [u32; 2],
    /// Flags; bit 31 is the generation bit.
    pub flags: u32,
}

impl TxComp {
    /// Generation bit as 0 or 1.
    pub fn generation(&self) -> u32 {
        u32::from(self.flags & TXCF_GEN != 0)
    }
}

/// An RX descriptor posted by the driver.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RxDesc {
    /// Bus address of the buffer payload.
    pub address: u64,
    /// 14-bit buffer length, buffer type, and the generation bit (bit 31).
    pub flags: u32,
    _reserved: u32,
}

/// An RX completion entry written by the device.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RxComp {
    /// Descriptor index (bits 0..12) and queue id (bits 16..26).
    pub index: u32,
    /// RSS hash of the frame.
    pub rss_hash: u32,
    /// Frame length in bits 0..14.
    pub len: u32,
    /// Flags; bit 31 is the generation bit.
    pub flags: u32,
}

impl RxComp {
    /// Generation bit as 0 or 1.
    pub fn generation(&self) -> u32 {
        u32::from(self.flags & RXCF_GEN != 0)
    }

    /// Queue id naming the descriptor ring this entry consumed from.
    pub fn qid(&self) -> u16 {
        ((self.index >> 16) & 0x3FF) as u16
    }

    /// Index of the consumed descriptor.
    pub fn ring_index(&self) -> u32 {
        self.index & 0xFFF
    }

    /// Received frame length.
    pub fn length(&self) -> u16 {
        (self.len & 0x3FFF) as u16
    }
}

/// Configuration of the TX queue, read by the device at activation.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TxQueueConfig {
    /// Bus address of the descriptor ring.
    pub desc_address: u64,
    /// Bus address of the completion ring.
    pub comp_address: u64,
    /// Descriptor ring capacity.
    pub num_desc: u32,
    /// Completion ring capacity.
    pub num_comp: u32,
    /// MSI-X vector index for TX completions.
    pub intr_index: u8,
    _pad: [u8; 7],
}

/// TX queue descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TxQueueDesc {
    /// Queue configuration.
    pub cfg: TxQueueConfig,
    _status: [u32; 8],
}

/// Configuration of one RX queue and its two descriptor rings.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RxQueueConfig {
    /// Bus addresses of descriptor rings 0 and 1.
    pub desc_address: [u64; 2],
    /// Bus address of the completion ring.
    pub comp_address: u64,
    /// Capacities of descriptor rings 0 and 1.
    pub num_desc: [u32; 2],
    /// Completion ring capacity.
    pub num_comp: u32,
    /// Length of the driver-private portion.
    pub driver_data_len: u32,
    /// MSI-X vector index for this queue.
    pub intr_index: u8,
    _pad: [u8; 3],
}

/// RX queue descriptor.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct RxQueueDesc {
    /// Queue configuration.
    pub cfg: RxQueueConfig,
    _status: [u32; 8],
}

/// All queue descriptors, pointed to from the shared area.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct QueueDescriptors {
    /// The single TX queue.
    pub tx: TxQueueDesc,
    /// The RX queues.
    pub rx: [RxQueueDesc; NUM_RX_QUEUES],
}

/// Guest identification within the shared area.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GuestInfo {
    /// Pointer width code of the guest.
    pub arch: u32,
    /// Guest OS type code.
    pub os_type: u32,
}

/// Miscellaneous driver configuration within the shared area.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MiscConfig {
    /// Guest identification.
    pub guest_info: GuestInfo,
    /// Driver version magic.
    pub version: u32,
    /// Device revisions the driver supports.
    pub version_support: u32,
    /// UPT versions the driver supports.
    pub upt_version_support: u32,
    /// Negotiated UPT feature bits.
    pub upt_features: u64,
    /// Bus address of the driver's DMA area.
    pub driver_data_address: u64,
    /// Bus address of the queue descriptors.
    pub queue_desc_address: u64,
    /// Length of the driver's DMA area.
    pub driver_data_len: u32,
    /// Length of the queue descriptors.
    pub queue_desc_len: u32,
    /// Largest frame the driver will post buffers for.
    pub mtu: u32,
    /// Maximum RX scatter-gather length (unused, single buffers only).
    pub max_num_rx_sg: u16,
    /// Number of TX queues.
    pub num_tx_queues: u8,
    /// Number of RX queues.
    pub num_rx_queues: u8,
    _reserved: [u32; 4],
}

/// Interrupt configuration within the shared area.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct InterruptConfig {
    /// Masking mode (auto/manual).
    pub mask_mode: u8,
    /// Number of allocated vectors.
    pub num_intrs: u8,
    /// Vector index delivering device events.
    pub event_intr_index: u8,
    /// Per-vector moderation levels.
    pub moderation_level: [u8; crate::regs::MAX_INTRS],
    /// Global interrupt control; bit 0 masks everything.
    pub control: u32,
    _reserved: [u32; 2],
}

impl Default for InterruptConfig {
    fn default() -> Self {
        InterruptConfig {
            mask_mode: 0,
            num_intrs: 0,
            event_intr_index: 0,
            moderation_level: [0; crate::regs::MAX_INTRS],
            control: 0,
            _reserved: [0; 2],
        }
    }
}

/// RX filter configuration within the shared area.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RxFilterConfig {
    /// Active filter mode bits.
    pub mode: u32,
    /// Multicast filter table length.
    pub mc_table_len: u16,
    _pad: u16,
    /// Multicast filter table bus address.
    pub mc_table_address: u64,
    /// VLAN filter bitmap.
    pub vlan_filter: [u32; 128],
}

impl Default for RxFilterConfig {
    fn default() -> Self {
        RxFilterConfig {
            mode: 0,
            mc_table_len: 0,
            _pad: 0,
            mc_table_address: 0,
            vlan_filter: [0; 128],
        }
    }
}

/// The shared info block, read by the device at activation and written
/// with event causes afterwards.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct DriverShared {
    /// Magic cookie identifying a revision-1 shared area.
    pub magic: u32,
    _pad: u32,
    /// Miscellaneous configuration.
    pub misc: MiscConfig,
    /// Interrupt configuration.
    pub interrupt: InterruptConfig,
    /// RX filter configuration.
    pub rx_filter: RxFilterConfig,
    /// Event cause bits, written by the device.
    pub ecr: u32,
    _reserved: [u32; 5],
}

/// Descriptor storage for one RX queue.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RxDmaRegion {
    /// Descriptor ring 0 (the larger ring).
    pub desc0: [RxDesc; NUM_RX_DESC0],
    /// Descriptor ring 1.
    pub desc1: [RxDesc; NUM_RX_DESC1],
    /// The queue's single completion ring.
    pub comp: [RxComp; NUM_RX_COMP],
}

/// The complete DMA area.
#[repr(C, align(512))]
pub struct DmaArea {
    /// TX descriptor ring.
    pub tx_desc: [TxDesc; NUM_TX_DESC],
    /// TX completion ring.
    pub tx_comp: [TxComp; NUM_TX_COMP],
    /// Per-queue RX rings.
    pub rx: [RxDmaRegion; NUM_RX_QUEUES],
    /// Queue descriptors.
    pub queues: QueueDescriptors,
    /// Shared info block.
    pub shared: DriverShared,
}

/// An owned, zero-initialized DMA area on the heap.
///
/// Allocated directly with the area's 512-byte alignment; the allocator
/// provides the alignment, so the base pointer is the one freed.
pub struct DmaBox {
    area: NonNull<DmaArea>,
}

// SAFETY: DmaBox exclusively owns its allocation. Concurrent device access
// is part of the DMA contract and is mediated by generation bits and
// fences, not by Rust aliasing.
unsafe impl Send for DmaBox {}

impl DmaBox {
    /// Allocate a zeroed DMA area.
    pub fn zeroed() -> DmaBox {
        let layout = Layout::new::<DmaArea>();
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(area) = NonNull::new(raw.cast::<DmaArea>()) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        DmaBox { area }
    }

    /// Raw pointer to the area.
    pub fn as_ptr(&self) -> *mut DmaArea {
        self.area.as_ptr()
    }

    /// Bus address of the area base (identity-mapped memory).
    pub fn bus_addr(&self) -> u64 {
        self.area.as_ptr() as u64
    }

    /// Pointer to TX descriptor `i`.
    pub fn tx_desc(&self, i: usize) -> *mut TxDesc {
        debug_assert!(i < NUM_TX_DESC);
        // SAFETY: in-bounds projection into the owned area.
        unsafe { addr_of_mut!((*self.as_ptr()).tx_desc[i]) }
    }

    /// Pointer to TX completion entry `i`.
    pub fn tx_comp(&self, i: usize) -> *mut TxComp {
        debug_assert!(i < NUM_TX_COMP);
        // SAFETY: in-bounds projection into the owned area.
        unsafe { addr_of_mut!((*self.as_ptr()).tx_comp[i]) }
    }

    /// Pointer to RX descriptor `i` of ring `ring` in queue `q`.
    pub fn rx_desc(&self, q: usize, ring: usize, i: usize) -> *mut RxDesc {
        // SAFETY: in-bounds projection into the owned area.
        unsafe {
            match ring {
                0 => {
                    debug_assert!(i < NUM_RX_DESC0);
                    addr_of_mut!((*self.as_ptr()).rx[q].desc0[i])
                }
                _ => {
                    debug_assert!(i < NUM_RX_DESC1);
                    addr_of_mut!((*self.as_ptr()).rx[q].desc1[i])
                }
            }
        }
    }

    /// Pointer to RX completion entry `i` of queue `q`.
    pub fn rx_comp(&self, q: usize, i: usize) -> *mut RxComp {
        debug_assert!(i < NUM_RX_COMP);
        // SAFETY: in-bounds projection into the owned area.
        unsafe { addr_of_mut!((*self.as_ptr()).rx[q].comp[i]) }
    }

    /// Pointer to the queue descriptors.
    pub fn queues(&self) -> *mut QueueDescriptors {
        // SAFETY: projection into the owned area.
        unsafe { addr_of_mut!((*self.as_ptr()).queues) }
    }

    /// Pointer to the shared info block.
    pub fn shared(&self) -> *mut DriverShared {
        // SAFETY: projection into the owned area.
        unsafe { addr_of_mut!((*self.as_ptr()).shared) }
    }
}

impl Drop for DmaBox {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe {
            alloc::alloc::dealloc(self.area.as_ptr().cast(), Layout::new::<DmaArea>());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, size_of};

    #[test]
    fn test_descriptor_sizes() {
        assert_eq!(size_of::<TxDesc>(), 16);
        assert_eq!(size_of::<TxComp>(), 16);
        assert_eq!(size_of::<RxDesc>(), 16);
        assert_eq!(size_of::<RxComp>(), 16);
    }

    #[test]
    fn test_area_alignment() {
        assert_eq!(align_of::<DmaArea>(), crate::regs::DMA_ALIGN);
        let dma = DmaBox::zeroed();
        assert_eq!(dma.bus_addr() % crate::regs::DMA_ALIGN as u64, 0);
    }

    #[test]
    fn test_zeroed_descriptors() {
        let dma = DmaBox::zeroed();
        // SAFETY: freshly allocated area, no device attached.
        unsafe {
            assert_eq!((*dma.rx_desc(0, 0, 0)).address, 0);
            assert_eq!((*dma.rx_desc(0, 1, NUM_RX_DESC1 - 1)).address, 0);
            assert_eq!((*dma.tx_comp(NUM_TX_COMP - 1)).flags, 0);
        }
    }

    #[test]
    fn test_rx_comp_fields() {
        let comp = RxComp {
            index: (3 << 16) | 42,
            rss_hash: 0,
            len: 0x8000 | 64,
            flags: crate::regs::RXCF_GEN,
        };
        assert_eq!(comp.qid(), 3);
        assert_eq!(comp.ring_index(), 42);
        assert_eq!(comp.length(), 64);
        assert_eq!(comp.generation(), 1);
    }
}

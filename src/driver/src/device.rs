//! The vmxnet3 data-plane driver.
//!
//! One instance owns a device's DMA area, its descriptor rings, a bounded
//! send queue and a buffer pool, and presents the [`Nic`] capability set to
//! the stack above. All entry points run on the owning CPU's event
//! dispatcher; the single state lock serializes them without ever being
//! held across an upstream callback, so the stack is free to call
//! `transmit` from inside `receive`.
//!
//! # Device contract
//!
//! The device is an independent agent sharing the DMA area. Descriptor
//! writes are published with a store-release fence before each doorbell;
//! completion payloads are read only after a load-acquire fence behind the
//! generation check. The generation bit is the sole ownership handshake.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile, NonNull};
use core::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::{Mutex, Once, RwLock};

use vmxnet3_common::{stats, DriverError, MacAddr};
use vmxnet3_hal::{
    BufferStore, DeviceRegisters, Downstream, EventDemux, IrqToken, LinkLayer, Nic, Packet,
    PciHandle,
};

use crate::bufstore::BufferPool;
use crate::deferred;
use crate::dma::{DmaArea, DmaBox, QueueDescriptors, NUM_RX_QUEUES, NUM_TX_COMP, NUM_TX_DESC};
use crate::mmio::MappedBars;
use crate::regs::{self, pt, vd, Command, EventCause, RxFilterMode};
use crate::ring::{CompCursor, DescRing, TxRing};

/// Gap between the buffer payload and the link-layer frame, aligning the
/// IP header to a 4-byte boundary.
pub const DRIVER_OFFSET: usize = 2;

/// Slack reserved at the front of every buffer for packet metadata and
/// header prepends.
pub const PACKET_HEADROOM: usize = 48;

/// Ethernet header plus one 802.1Q tag.
pub const VLAN_HEADER_LEN: usize = 18;

/// Buffers added to the pool per growth step.
const SLAB_BUFFERS: usize = 1024;

/// Platform interrupt vector base; MSI-X entries are routed above it.
const IRQ_BASE: u8 = 32;

/// Capacities of the two RX descriptor rings.
const RX_RING_SIZES: [u32; 2] = [crate::dma::NUM_RX_DESC0 as u32, crate::dma::NUM_RX_DESC1 as u32];

/// Counter assigning `eth<N>` names to discovered NICs.
static NIC_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Buffer size for a given MTU: headroom, driver offset, a VLAN-tagged
/// Ethernet header and the payload, rounded up to a 16-byte multiple.
pub fn buffer_size_for_mtu(mtu: u16) -> usize {
    let total = PACKET_HEADROOM + DRIVER_OFFSET + VLAN_HEADER_LEN + mtu as usize;
    let total = (total + 15) & !15;
    assert!(
        total <= regs::MAX_BUFFER_LEN,
        "buffers larger than 16k are not supported"
    );
    total
}

/// Driver-side state of one RX queue: two descriptor rings feeding a
/// single completion ring.
struct RxQueueState {
    /// Ring 0 and ring 1 cursors.
    rings: [DescRing; 2],
    /// Completion ring cursor.
    comp: CompCursor,
    /// Descriptors produced since activation; zero means the initial fill
    /// is still running and skips the admission predicate.
    prod_count: u32,
    /// Queue id tag of ring 0 in completion entries.
    id0: u16,
    /// Queue id tag of ring 1.
    id1: u16,
}

impl RxQueueState {
    fn new(q: usize) -> RxQueueState {
        RxQueueState {
            rings: [
                DescRing::new(RX_RING_SIZES[0]),
                DescRing::new(RX_RING_SIZES[1]),
            ],
            comp: CompCursor::new(RX_RING_SIZES[0] + RX_RING_SIZES[1]),
            prod_count: 0,
            id0: q as u16,
            id1: (q + NUM_RX_QUEUES) as u16,
        }
    }
}

/// Mutable driver state, serialized by the instance lock.
struct Inner {
    dma: DmaBox,
    tx: TxRing,
    rx: [RxQueueState; NUM_RX_QUEUES],
    /// Outbound packets waiting for TX ring space, in FIFO order.
    sendq: VecDeque<Packet>,
    link_up: bool,
    active: bool,
}

/// A vmxnet3 NIC instance.
pub struct Vmxnet3 {
    name: String,
    mtu: u16,
    mac: MacAddr,
    pci: Arc<dyn PciHandle>,
    regs: Arc<dyn DeviceRegisters>,
    events: Arc<dyn EventDemux>,
    store: Arc<dyn BufferStore>,
    upstream: RwLock<Option<Arc<dyn LinkLayer>>>,
    inner: Mutex<Inner>,
    /// MSI-X event tokens: [event, tx, rx per queue].
    irqs: Mutex<Vec<IrqToken>>,
    /// Token of the deferred-kick event.
    deferred_irq: IrqToken,
    /// Excludes concurrent polls.
    already_polling: AtomicBool,
    /// A doorbell write is pending with the deferred handler.
    deferred_kick: AtomicBool,
    /// Back-reference handed to event handler closures.
    myself: Once<Weak<Vmxnet3>>,
    stat_sendq_now: Arc<AtomicU32>,
    stat_sendq_max: Arc<AtomicU32>,
    stat_rx_refill_dropped: Arc<AtomicU64>,
    stat_sendq_dropped: Arc<AtomicU64>,
}

/// Factory registered with the PCI manager.
pub fn new_instance(pci: Arc<dyn PciHandle>, mtu: u16) -> Result<Arc<dyn Nic>, DriverError> {
    let dev = Vmxnet3::new(pci, mtu)?;
    Ok(dev)
}

impl Vmxnet3 {
    /// Probe an initialized PCI function and bring the device up.
    pub fn new(pci: Arc<dyn PciHandle>, mtu: u16) -> Result<Arc<Vmxnet3>, DriverError> {
        pci.parse_capabilities();
        pci.probe_resources();
        let bars = Arc::new(MappedBars::map(pci.as_ref())?);
        Vmxnet3::with_registers(pci, bars, crate::events(), mtu)
    }

    /// Bring the device up over an already-resolved register interface.
    ///
    /// `new` builds the register windows from the PCI BARs; this entry
    /// point accepts any [`DeviceRegisters`] implementation and the event
    /// demultiplexer to attach to.
    pub fn with_registers(
        pci: Arc<dyn PciHandle>,
        regs: Arc<dyn DeviceRegisters>,
        events: Arc<dyn EventDemux>,
        mtu: u16,
    ) -> Result<Arc<Vmxnet3>, DriverError> {
        if pci.revision_id() != regs::REVISION_ID {
            return Err(DriverError::UnsupportedDevice);
        }

        let name = format!("eth{}", NIC_INDEX.fetch_add(1, Ordering::Relaxed));
        log::info!("{}: vmxnet3 driver initializing", name);

        let bufsize = buffer_size_for_mtu(mtu);
        let store: Arc<dyn BufferStore> = BufferPool::new(SLAB_BUFFERS, bufsize);
        stats::create_u32(&format!("{}.buffer_size", name)).store(bufsize as u32, Ordering::Relaxed);
        let stat_sendq_now = stats::create_u32(&format!("{}.sendq_now", name));
        let stat_sendq_max = stats::create_u32(&format!("{}.sendq_max", name));
        let stat_rx_refill_dropped = stats::create_u64(&format!("{}.rx_refill_dropped", name));
        let stat_sendq_dropped = stats::create_u64(&format!("{}.sendq_dropped", name));

        // Legacy IRQs are unsupported; MSI-X is required.
        if !pci.has_msix() {
            return Err(DriverError::NoMsix);
        }
        pci.init_msix();
        let vectors = pci.msix_vector_count() as usize;
        log::info!("{}: device has {} MSI-X vectors", name, vectors);
        if vectors < 2 + NUM_RX_QUEUES {
            return Err(DriverError::NoMsix);
        }

        let cpu = events.current_cpu();
        let mut irqs = Vec::with_capacity(2 + NUM_RX_QUEUES);
        for _ in 0..2 + NUM_RX_QUEUES {
            let token = events.reserve();
            pci.setup_msix_vector(cpu, IRQ_BASE + token.0);
            irqs.push(token);
        }

        // Version negotiation: the registers report support masks, bit 0
        // meaning version 1. Select version 1 on both.
        let versions = regs.vd_read(vd::REVISION);
        let upt_versions = regs.vd_read(vd::UPT_VERSION);
        log::info!(
            "{}: device version masks {:#x}/{:#x}",
            name,
            versions,
            upt_versions
        );
        if versions & 1 == 0 || upt_versions & 1 == 0 {
            return Err(DriverError::UnsupportedDevice);
        }
        regs.vd_write(vd::REVISION, 0x1);
        regs.vd_write(vd::UPT_VERSION, 0x1);

        // Reset; status must read zero.
        regs.vd_write(vd::CMD, Command::ResetDev as u32);
        if regs.vd_read(vd::CMD) != 0 {
            return Err(DriverError::UnsupportedDevice);
        }

        let mac = MacAddr::from_registers(regs.vd_read(vd::MAC_LO), regs.vd_read(vd::MAC_HI));
        log::info!("{}: MAC address {}", name, mac);

        regs.vd_write(vd::CMD, Command::GetLink as u32);
        let link = regs.vd_read(vd::CMD);
        let link_up = link & 1 != 0;
        if link_up {
            log::info!("{}: link up at {} Mbps", name, link >> 16);
        } else {
            log::warn!("{}: link down, device stays idle", name);
        }

        let deferred_irq = events.subscribe(Box::new(deferred::handle_deferred));

        let dev = Arc::new(Vmxnet3 {
            name,
            mtu,
            mac,
            pci,
            regs,
            events,
            store,
            upstream: RwLock::new(None),
            inner: Mutex::new(Inner {
                dma: DmaBox::zeroed(),
                tx: TxRing::new(),
                rx: core::array::from_fn(RxQueueState::new),
                sendq: VecDeque::new(),
                link_up,
                active: false,
            }),
            irqs: Mutex::new(irqs),
            deferred_irq,
            already_polling: AtomicBool::new(false),
            deferred_kick: AtomicBool::new(false),
            myself: Once::new(),
            stat_sendq_now,
            stat_sendq_max,
            stat_rx_refill_dropped,
            stat_sendq_dropped,
        });
        dev.myself.call_once(|| Arc::downgrade(&dev));

        if link_up {
            dev.activate()?;
        }
        dev.install_handlers();
        Ok(dev)
    }

    /// The buffer store backing this device's packets.
    pub fn buffer_store(&self) -> &Arc<dyn BufferStore> {
        &self.store
    }

    /// A transmit entry point bound to this instance.
    pub fn create_physical_downstream(this: &Arc<Vmxnet3>) -> Downstream {
        let dev = this.clone();
        Box::new(move |packet| dev.transmit_packet(packet))
    }

    // -----------------------------------------------------------------
    // Register plumbing
    // -----------------------------------------------------------------

    /// Issue a command and read back its status.
    fn command(&self, cmd: Command) -> u32 {
        self.regs.vd_write(vd::CMD, cmd as u32);
        self.regs.vd_read(vd::CMD)
    }

    fn enable_intr(&self, idx: u8) {
        self.regs.pt_write(pt::IMR + u32::from(idx) * 8, 0);
    }

    fn disable_intr(&self, idx: u8) {
        self.regs.pt_write(pt::IMR + u32::from(idx) * 8, 1);
    }

    /// Query link state, updating the cached flag. Returns the speed in
    /// Mbps, zero when down.
    fn check_link(&self, inner: &mut Inner) -> u16 {
        let state = self.command(Command::GetLink);
        inner.link_up = state & 1 != 0;
        if inner.link_up {
            (state >> 16) as u16
        } else {
            0
        }
    }

    // -----------------------------------------------------------------
    // Activation
    // -----------------------------------------------------------------

    /// Populate the shared area, activate the device, and arm the RX
    /// rings.
    fn activate(&self) -> Result<(), DriverError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let (lo, hi) = self.mac.to_registers();
        self.regs.vd_write(vd::MAC_LO, lo);
        self.regs.vd_write(vd::MAC_HI, hi);

        let dma = &inner.dma;
        // SAFETY: the device is not active yet; the DMA area is still
        // driver-private memory.
        unsafe {
            let queues = dma.queues();
            let tx_cfg = &mut (*queues).tx.cfg;
            tx_cfg.desc_address = dma.tx_desc(0) as u64;
            tx_cfg.comp_address = dma.tx_comp(0) as u64;
            tx_cfg.num_desc = NUM_TX_DESC as u32;
            tx_cfg.num_comp = NUM_TX_COMP as u32;
            tx_cfg.intr_index = 1;

            for q in 0..NUM_RX_QUEUES {
                let rx_cfg = &mut (*queues).rx[q].cfg;
                rx_cfg.desc_address = [dma.rx_desc(q, 0, 0) as u64, dma.rx_desc(q, 1, 0) as u64];
                rx_cfg.comp_address = dma.rx_comp(q, 0) as u64;
                rx_cfg.num_desc = RX_RING_SIZES;
                rx_cfg.num_comp = RX_RING_SIZES[0] + RX_RING_SIZES[1];
                rx_cfg.driver_data_len = 0;
                rx_cfg.intr_index = (2 + q) as u8;
            }

            let shared = dma.shared();
            (*shared).magic = regs::REV1_MAGIC;
            let misc = &mut (*shared).misc;
            misc.guest_info.arch = if core::mem::size_of::<usize>() == 4 {
                regs::GOS_BITS_32
            } else {
                regs::GOS_BITS_64
            };
            misc.guest_info.os_type = regs::GOS_TYPE_LINUX;
            misc.version = regs::VERSION_MAGIC;
            misc.version_support = 1;
            misc.upt_version_support = 1;
            misc.upt_features = 0;
            misc.driver_data_address = dma.bus_addr();
            misc.queue_desc_address = dma.queues() as u64;
            misc.driver_data_len = core::mem::size_of::<DmaArea>() as u32;
            misc.queue_desc_len = core::mem::size_of::<QueueDescriptors>() as u32;
            misc.mtu = u32::from(self.max_packet_len_raw());
            misc.num_tx_queues = 1;
            misc.num_rx_queues = NUM_RX_QUEUES as u8;

            let intr = &mut (*shared).interrupt;
            intr.mask_mode = regs::IT_AUTO | (regs::IMM_AUTO << 2);
            intr.num_intrs = (2 + NUM_RX_QUEUES) as u8;
            intr.event_intr_index = 0;
            intr.moderation_level = [regs::IML_ADAPTIVE; regs::MAX_INTRS];
            intr.control = 0x1; // everything masked until we unmask below

            (*shared).rx_filter.mode =
                (RxFilterMode::UCAST | RxFilterMode::BCAST | RxFilterMode::ALL_MULTI).bits();
        }

        // Publish the shared area and activate. The fence orders the area
        // contents before the address becomes visible to the device.
        // Both halves carry the real bus address; the high word is zero
        // whenever the area is mapped below 4GB.
        let shabus = dma.shared() as u64;
        fence(Ordering::Release);
        self.regs.vd_write(vd::SHARED_LO, shabus as u32);
        self.regs.vd_write(vd::SHARED_HI, (shabus >> 32) as u32);

        let status = self.command(Command::ActivateDev);
        if status != 0 {
            log::error!("{}: activation failed, status {:#x}", self.name, status);
            return Err(DriverError::ActivationFailed);
        }
        inner.active = true;

        for q in 0..NUM_RX_QUEUES {
            inner.rx[q] = RxQueueState::new(q);
            self.refill(inner, q);
        }

        drop(guard);
        self.enable_intr(0);
        self.enable_intr(1);
        for q in 0..NUM_RX_QUEUES {
            self.enable_intr((2 + q) as u8);
        }
        Ok(())
    }

    fn max_packet_len_raw(&self) -> u16 {
        VLAN_HEADER_LEN as u16 + self.mtu
    }

    // -----------------------------------------------------------------
    // RX path
    // -----------------------------------------------------------------

    /// Replenish both descriptor rings of queue `q` from the buffer pool.
    ///
    /// The initial fill after activation runs unconditionally; later
    /// refills stop when the upstream admission predicate denies more
    /// buffers, charging the shortfall to `rx_refill_dropped`.
    fn refill(&self, inner: &mut Inner, q: usize) {
        let upstream = self.upstream.read().clone();
        let max_len = u32::from(self.max_packet_len_raw()) & 0x7FFF;
        let mut advanced = [false; 2];
        let mut producers = [0u32; 2];

        {
            let Inner { dma, rx, .. } = inner;
            let rxq = &mut rx[q];
            for r in 0..2 {
                let ring = &mut rxq.rings[r];
                while ring.unallocated > 0 {
                    if rxq.prod_count > 0 {
                        let in_use = self.store.buffers_in_use();
                        let allowed = upstream
                            .as_ref()
                            .map_or(true, |u| u.buffers_still_available(in_use));
                        if !allowed {
                            log::warn!(
                                "{}: out of buffers, rx ring {} short {}",
                                self.name,
                                r,
                                ring.unallocated
                            );
                            self.stat_rx_refill_dropped
                                .fetch_add(u64::from(ring.unallocated), Ordering::Relaxed);
                            break;
                        }
                    }
                    let Some(buf) = self.store.get_buffer() else {
                        self.stat_rx_refill_dropped
                            .fetch_add(u64::from(ring.unallocated), Ordering::Relaxed);
                        break;
                    };

                    let i = ring.producers as usize;
                    let desc = dma.rx_desc(q, r, i);
                    let bus = buf.as_ptr() as u64 + (PACKET_HEADROOM + DRIVER_OFFSET) as u64;
                    let mut flags = max_len;
                    if ring.generation == 1 {
                        flags |= regs::RXF_GEN;
                    }
                    // SAFETY: the slot is driver-owned while unallocated;
                    // the address is written before the flag word carrying
                    // the generation bit.
                    unsafe {
                        debug_assert_eq!(read_volatile(addr_of!((*desc).address)), 0);
                        write_volatile(addr_of_mut!((*desc).address), bus);
                        write_volatile(addr_of_mut!((*desc).flags), flags);
                    }
                    rxq.prod_count += 1;
                    advanced[r] = true;
                    if ring.advance_producer() {
                        break;
                    }
                }
                producers[r] = ring.producers;
            }
        }

        if advanced[0] || advanced[1] {
            // Descriptor stores must be visible before the doorbells.
            fence(Ordering::Release);
        }
        let rxq = &inner.rx[q];
        if advanced[0] {
            self.regs
                .pt_write(pt::RXPROD0 + u32::from(rxq.id0) * 8, producers[0]);
        }
        if advanced[1] {
            self.regs
                .pt_write(pt::RXPROD1 + u32::from(rxq.id1) * 8, producers[1]);
        }
    }

    /// Reconstruct an upstream packet around a completed RX buffer.
    ///
    /// # Safety
    ///
    /// `addr` must be a payload bus address this driver posted, whose
    /// buffer the device has just returned.
    unsafe fn packet_from_dma(&self, addr: u64, len: u16) -> Packet {
        let base = (addr as usize - PACKET_HEADROOM - DRIVER_OFFSET) as *mut u8;
        // SAFETY: refill posted addr as base + headroom + driver offset of
        // an exclusively owned buffer.
        unsafe {
            Packet::from_raw(
                NonNull::new_unchecked(base),
                (PACKET_HEADROOM + DRIVER_OFFSET) as u32,
                u32::from(len),
                self.store.clone(),
            )
        }
    }

    /// Drain queue `q`'s completion ring and deliver the batch upstream.
    ///
    /// Returns true when at least one packet was delivered.
    fn receive_handler(&self, q: usize) -> bool {
        self.disable_intr((2 + q) as u8);

        let mut batch: Vec<Packet> = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            {
                let Inner { dma, rx, .. } = inner;
                let rxq = &mut rx[q];
                loop {
                    // SAFETY: completion entries are device-written; the
                    // generation check below decides ownership.
                    let entry = unsafe { read_volatile(dma.rx_comp(q, rxq.comp.consumers as usize)) };
                    if entry.generation() != rxq.comp.generation {
                        break;
                    }
                    // No reads of the entry payload before the generation
                    // check is confirmed.
                    fence(Ordering::Acquire);

                    let qid = entry.qid();
                    let r = if qid == rxq.id0 {
                        0
                    } else if qid == rxq.id1 {
                        1
                    } else {
                        log::error!("{}: unknown rx completion queue id {}", self.name, qid);
                        panic!("vmxnet3: unknown rx completion queue id {}", qid);
                    };

                    let slot = rxq.rings[r].advance_consumer() as usize;
                    let desc = dma.rx_desc(q, r, slot);
                    // SAFETY: the device returned this slot via the
                    // completion entry; it is driver-owned again.
                    let addr = unsafe { read_volatile(addr_of!((*desc).address)) };
                    assert!(addr != 0, "rx completion for an empty descriptor");

                    let len = entry.length();
                    debug_assert!(len <= self.max_packet_len_raw());
                    // SAFETY: addr was posted by refill from our pool.
                    batch.push(unsafe { self.packet_from_dma(addr, len) });

                    // SAFETY: slot is driver-owned, see above.
                    unsafe { write_volatile(addr_of_mut!((*desc).address), 0) };
                    rxq.comp.advance();

                    if rxq.rings[r].credit_slot() {
                        // The ring drained completely; stop and refill.
                        break;
                    }
                }
            }
            if !batch.is_empty() {
                self.refill(inner, q);
                fence(Ordering::Release);
            }
        }

        self.enable_intr((2 + q) as u8);

        let delivered = !batch.is_empty();
        if let Some(upstream) = self.upstream.read().clone() {
            for packet in batch {
                upstream.receive(packet);
            }
        }
        delivered
    }

    // -----------------------------------------------------------------
    // TX path
    // -----------------------------------------------------------------

    fn can_transmit(&self, inner: &Inner) -> bool {
        inner.tx.tokens_free() > 0 && inner.link_up
    }

    /// Write one packet into the TX descriptor at the producer cursor.
    fn transmit_data(&self, inner: &mut Inner, packet: Packet) {
        let bus = packet.payload_ptr().as_ptr() as u64;
        let len = packet.len() as u32;

        let tx = &mut inner.tx;
        let idx = (tx.producers % NUM_TX_DESC as u32) as usize;
        // Bit log2(N_TX) of the producer cursor selects the generation.
        let generation = if tx.producers & NUM_TX_DESC as u32 == 0 {
            regs::TXF_GEN
        } else {
            0
        };
        tx.producers = tx.producers.wrapping_add(1);

        debug_assert!(tx.buffers[idx].is_none());
        tx.buffers[idx] = Some(packet.into_buffer_raw());

        let desc = inner.dma.tx_desc(idx);
        // SAFETY: the slot is free (token accounting keeps one slot
        // reserved); the device sees it only after the doorbell fence.
        unsafe {
            write_volatile(addr_of_mut!((*desc).address), bus);
            write_volatile(addr_of_mut!((*desc).flags[0]), generation | len);
            write_volatile(addr_of_mut!((*desc).flags[1]), regs::TXF_CQ | regs::TXF_EOP);
        }
    }

    /// Move packets from the send queue into the TX ring while tokens and
    /// link allow. Returns how many were written.
    fn drain_sendq(&self, inner: &mut Inner) -> usize {
        let mut sent = 0;
        while self.can_transmit(inner) {
            let Some(packet) = inner.sendq.pop_front() else {
                break;
            };
            self.transmit_data(inner, packet);
            sent += 1;
        }
        sent
    }

    fn update_sendq_stats(&self, inner: &Inner) {
        let depth = inner.sendq.len() as u32;
        self.stat_sendq_now.store(depth, Ordering::Relaxed);
        self.stat_sendq_max.fetch_max(depth, Ordering::Relaxed);
    }

    /// Queue an outbound chain, drain into the ring, and schedule the
    /// deferred doorbell.
    fn transmit_packet(&self, packet: Packet) {
        let upstream = self.upstream.read().clone();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            let mut next = Some(packet);
            while let Some(mut pkt) = next {
                let admitted = upstream
                    .as_ref()
                    .map_or(true, |u| u.sendq_still_available(inner.sendq.len()));
                if !admitted {
                    self.stat_sendq_dropped
                        .fetch_add(pkt.chain_length() as u64, Ordering::Relaxed);
                    break;
                }
                next = pkt.detach_tail();
                inner.sendq.push_back(pkt);
            }

            self.drain_sendq(inner);
            self.update_sendq_stats(inner);
        }
        // Delay the doorbell until the dispatcher runs the deferred
        // handler, batching it across calls.
        self.schedule_kick();
    }

    /// Reclaim completed TX descriptors, feed the ring from the send
    /// queue, and announce regained capacity upstream.
    fn transmit_handler(&self) -> bool {
        let mut transmitted = false;
        let mut kick = false;
        let mut notify = None;
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            loop {
                let idx = (inner.tx.consumers % NUM_TX_COMP as u32) as usize;
                let expected = if inner.tx.consumers & NUM_TX_COMP as u32 != 0 {
                    0
                } else {
                    regs::TXCF_GEN
                };
                // SAFETY: completion entries are device-written; ownership
                // is decided by the generation comparison.
                let comp = unsafe { read_volatile(inner.dma.tx_comp(idx)) };
                if comp.flags & regs::TXCF_GEN != expected {
                    break;
                }
                fence(Ordering::Acquire);
                inner.tx.consumers = inner.tx.consumers.wrapping_add(1);

                let slot = (comp.index % NUM_TX_DESC as u32) as usize;
                match inner.tx.buffers[slot].take() {
                    Some(buf) => self.store.release(buf),
                    None => {
                        log::warn!("{}: tx completion for empty slot {}", self.name, slot);
                    }
                }
            }

            if self.can_transmit(inner) && !inner.sendq.is_empty() {
                if self.drain_sendq(inner) > 0 {
                    transmitted = true;
                    kick = true;
                }
                self.update_sendq_stats(inner);
            }
            if self.can_transmit(inner) {
                notify = Some(inner.tx.tokens_free());
            }
        }

        if kick {
            self.schedule_kick();
        }
        if let Some(tokens) = notify {
            if let Some(upstream) = self.upstream.read().clone() {
                upstream.transmit_queue_available_event(tokens as usize);
                // The callback may have transmitted; treat consumed tokens
                // as work done.
                if self.inner.lock().tx.tokens_free() != tokens {
                    transmitted = true;
                }
            }
        }
        transmitted
    }

    /// Publish the TX producer cursor if it moved since the last doorbell.
    pub(crate) fn flush_now(&self) {
        let mut inner = self.inner.lock();
        if inner.tx.flush_diff() > 0 {
            let idx = inner.tx.producers % NUM_TX_DESC as u32;
            // Descriptor stores must be visible before the doorbell.
            fence(Ordering::Release);
            self.regs.pt_write(pt::TXPROD, idx);
            inner.tx.flushvalue = inner.tx.producers;
        }
    }

    pub(crate) fn clear_kick(&self) {
        self.deferred_kick.store(false, Ordering::Release);
    }

    /// Register with the deferred-kick set and trigger the flush event,
    /// once per pending batch.
    fn schedule_kick(&self) {
        if !self.deferred_kick.swap(true, Ordering::AcqRel)
            && !self.already_polling.load(Ordering::Acquire)
        {
            if let Some(me) = self.myself.get().and_then(Weak::upgrade) {
                deferred::register(me);
                self.events.trigger(self.deferred_irq);
            }
        }
    }

    // -----------------------------------------------------------------
    // Interrupt handlers
    // -----------------------------------------------------------------

    /// Event vector: decode and acknowledge the event cause register.
    fn evt_handler(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        // SAFETY: ecr is device-written; a stale read only delays the
        // event until the next interrupt.
        let ecr = unsafe { read_volatile(addr_of!((*inner.dma.shared()).ecr)) };
        if ecr == 0 {
            return;
        }
        // Write back to acknowledge everything we saw.
        self.regs.vd_write(vd::ECR, ecr);

        let causes = EventCause::from_bits_truncate(ecr);
        if causes.contains(EventCause::RXQ_ERROR) {
            log::error!("{}: rx queue error, ecr {:#x}", self.name, ecr);
        }
        if causes.contains(EventCause::TXQ_ERROR) {
            log::error!("{}: tx queue error, ecr {:#x}", self.name, ecr);
        }
        if causes.contains(EventCause::DEVICE_WAKE) {
            let speed = self.check_link(inner);
            log::info!(
                "{}: resumed, link {} ({} Mbps)",
                self.name,
                if inner.link_up { "up" } else { "down" },
                speed
            );
        }
        if causes.contains(EventCause::LINK_CHANGE) {
            let speed = self.check_link(inner);
            log::info!(
                "{}: link changed, now {} ({} Mbps)",
                self.name,
                if inner.link_up { "up" } else { "down" },
                speed
            );
        }
        if ecr & !EventCause::all().bits() != 0 {
            log::warn!("{}: unknown event bits in ecr {:#x}", self.name, ecr);
        }
    }

    /// TX completion vector.
    fn xmit_handler(&self) {
        self.disable_intr(1);
        self.transmit_handler();
        self.enable_intr(1);
    }

    /// RX vector: service every queue.
    fn recv_handler(&self) {
        for q in 0..NUM_RX_QUEUES {
            self.receive_handler(q);
        }
    }

    /// Install the MSI-X handlers on the currently reserved tokens.
    fn install_handlers(&self) {
        let Some(me) = self.myself.get().and_then(Weak::upgrade) else {
            return;
        };
        let irqs = self.irqs.lock().clone();

        let dev = me.clone();
        self.events
            .install(irqs[0], Box::new(move || dev.evt_handler()));
        let dev = me.clone();
        self.events
            .install(irqs[1], Box::new(move || dev.xmit_handler()));
        for q in 0..NUM_RX_QUEUES {
            let dev = me.clone();
            self.events
                .install(irqs[2 + q], Box::new(move || dev.recv_handler()));
        }
    }

    // -----------------------------------------------------------------
    // Deactivation sweep
    // -----------------------------------------------------------------

    /// Return every in-flight buffer to the store after a reset.
    fn sweep_buffers(&self, inner: &mut Inner) {
        for slot in inner.tx.buffers.iter_mut() {
            if let Some(buf) = slot.take() {
                self.store.release(buf);
            }
        }
        inner.tx = TxRing::new();

        let Inner { dma, rx, .. } = inner;
        for (q, rxq) in rx.iter_mut().enumerate() {
            for r in 0..2 {
                for i in 0..rxq.rings[r].size as usize {
                    let desc = dma.rx_desc(q, r, i);
                    // SAFETY: the device is reset; the area is
                    // driver-private again.
                    let addr = unsafe { read_volatile(addr_of!((*desc).address)) };
                    if addr != 0 {
                        let base = (addr as usize - PACKET_HEADROOM - DRIVER_OFFSET) as *mut u8;
                        // SAFETY: posted by refill from our pool.
                        self.store
                            .release(unsafe { NonNull::new_unchecked(base) });
                        // SAFETY: driver-private, see above.
                        unsafe { write_volatile(addr_of_mut!((*desc).address), 0) };
                    }
                }
            }
            *rxq = RxQueueState::new(q);
        }

        inner.sendq.clear();
        self.update_sendq_stats(inner);
    }
}

impl Nic for Vmxnet3 {
    fn driver_name(&self) -> &'static str {
        "vmxnet3"
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn max_packet_len(&self) -> u16 {
        self.max_packet_len_raw()
    }

    fn set_link_layer(&self, upstream: Arc<dyn LinkLayer>) {
        *self.upstream.write() = Some(upstream);
    }

    fn transmit(&self, packet: Packet) {
        self.transmit_packet(packet);
    }

    fn flush(&self) {
        self.flush_now();
    }

    fn poll(&self) {
        let awaiting = self
            .upstream
            .read()
            .as_ref()
            .map_or(false, |u| u.awaiting_transmit_capacity());
        if !awaiting {
            return;
        }
        if self.already_polling.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let mut work = false;
            for q in 0..NUM_RX_QUEUES {
                work |= self.receive_handler(q);
            }
            work |= self.transmit_handler();
            if self.deferred_kick.swap(false, Ordering::AcqRel) {
                self.flush_now();
            }
            if !work {
                break;
            }
        }

        self.already_polling.store(false, Ordering::Release);
    }

    fn transmit_queue_available(&self) -> usize {
        self.inner.lock().tx.tokens_free() as usize
    }

    fn create_packet(&self, link_offset: usize) -> Option<Packet> {
        let buf = self.store.get_buffer()?;
        let offset = (PACKET_HEADROOM + DRIVER_OFFSET + link_offset) as u32;
        // SAFETY: fresh exclusively owned buffer from our own store.
        Some(unsafe { Packet::from_raw(buf, offset, 0, self.store.clone()) })
    }

    fn deactivate(&self) {
        self.disable_intr(0);
        self.disable_intr(1);
        for q in 0..NUM_RX_QUEUES {
            self.disable_intr((2 + q) as u8);
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.command(Command::ResetDev);
        inner.active = false;
        self.sweep_buffers(inner);
    }

    fn move_to_this_cpu(&self) {
        self.store.move_to_this_cpu();

        if self.pci.has_msix() {
            let cpu = self.events.current_cpu();
            let mut irqs = self.irqs.lock();
            for i in 0..irqs.len() {
                let token = self.events.reserve();
                irqs[i] = token;
                self.pci.rebalance_msix_vector(i, cpu, IRQ_BASE + token.0);
            }
            drop(irqs);
            self.install_handlers();
        }
    }
}

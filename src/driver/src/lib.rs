//! vmxnet3 — paravirtual Ethernet driver for the VMware virtual NIC.
//!
//! The driver binds to the vmxnet3 PCI function, manages its DMA-backed
//! descriptor rings, services its MSI-X vectors, and presents an Ethernet
//! link-layer endpoint to the stack above.
//!
//! # Architecture
//!
//! - `regs`: register layout, commands, and wire constants
//! - `mmio`: volatile access to the mapped BAR windows
//! - `dma`: the shared DMA area and its descriptor formats
//! - `ring`: producer/consumer cursor and generation bookkeeping
//! - `bufstore`: slab-backed packet buffer pool
//! - `device`: the data-plane core
//! - `deferred`: batched doorbell writes
//! - `manager`: PCI (vendor, product) → driver factory table
//! - `phy`: smoltcp `phy::Device` adapter
//!
//! # Safety
//!
//! This is a `no_std` crate sharing memory with a DMA-capable device. All
//! unsafe code is documented with the invariant that makes it sound; the
//! device side of each ring is mediated by generation bits and explicit
//! acquire/release fences.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod bufstore;
pub mod deferred;
pub mod device;
pub mod dma;
pub mod manager;
pub mod mmio;
pub mod phy;
pub mod regs;
pub mod ring;

use alloc::sync::Arc;
use spin::Once;
use vmxnet3_hal::EventDemux;

pub use bufstore::BufferPool;
pub use device::{buffer_size_for_mtu, Vmxnet3};

/// The host event demultiplexer drivers attach their vectors to.
static EVENTS: Once<Arc<dyn EventDemux>> = Once::new();

/// Wire the driver into a host at boot.
///
/// Stores the event demultiplexer and registers the vmxnet3 factory with
/// the PCI manager, so enumeration can instantiate devices on match.
pub fn init(events: Arc<dyn EventDemux>) {
    EVENTS.call_once(|| events);
    manager::register_driver(
        regs::PCI_VENDOR_VMWARE,
        regs::PCI_PRODUCT_VMXNET3,
        device::new_instance,
    );
}

/// The demultiplexer registered via [`init`].
pub(crate) fn events() -> Arc<dyn EventDemux> {
    EVENTS
        .get()
        .expect("vmxnet3::init must run before device probe")
        .clone()
}

//! Hardware and host abstraction traits for the NIC driver.
//!
//! This crate defines the seams between the driver core and its
//! collaborators: the PCI device it binds to, the mapped register windows,
//! the host's event demultiplexer, the buffer store, and the link layer
//! above the driver. The driver core only ever talks to these traits, so a
//! host kernel plugs in its own implementations and a test harness can
//! substitute a simulated device.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod events;
pub mod packet;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;

use vmxnet3_common::{DriverError, MacAddr};

pub use packet::Packet;

/// An initialized PCI function the driver binds to.
///
/// Capability parsing, BAR decoding and the MSI-X table live in the host's
/// PCI layer; the driver only consumes the results.
pub trait PciHandle: Send + Sync {
    /// PCI vendor id.
    fn vendor_id(&self) -> u16;
    /// PCI product id.
    fn product_id(&self) -> u16;
    /// PCI revision id.
    fn revision_id(&self) -> u8;
    /// Walk and cache the capability list.
    fn parse_capabilities(&self);
    /// Resolve BARs and enable memory space plus bus mastering.
    fn probe_resources(&self);
    /// Base address of a memory BAR, if present.
    fn bar(&self, index: u8) -> Option<u64>;
    /// Whether the function exposes an MSI-X capability.
    fn has_msix(&self) -> bool;
    /// Initialize the MSI-X table.
    fn init_msix(&self);
    /// Number of MSI-X table entries.
    fn msix_vector_count(&self) -> u8;
    /// Route the next free MSI-X entry to `vector` on `cpu`.
    fn setup_msix_vector(&self, cpu: u32, vector: u8);
    /// Re-route MSI-X entry `index` to `vector` on `cpu`.
    fn rebalance_msix_vector(&self, index: usize, cpu: u32, vector: u8);
}

/// Typed 32-bit access to the device's two register windows.
///
/// The production implementation maps the VD (virtual device) and PT
/// (pass-through doorbell) BARs and performs volatile loads and stores; the
/// accesses must never be coalesced or reordered by the compiler.
pub trait DeviceRegisters: Send + Sync {
    /// Read a 32-bit VD register.
    fn vd_read(&self, offset: u32) -> u32;
    /// Write a 32-bit VD register.
    fn vd_write(&self, offset: u32, value: u32);
    /// Write a 32-bit PT register (interrupt masks and doorbells).
    fn pt_write(&self, offset: u32, value: u32);
}

/// Identifier of a subscribed event slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqToken(pub u8);

/// A handler invoked by the event dispatcher.
pub type EventHandler = Box<dyn FnMut() + Send>;

/// The host's per-CPU event demultiplexer.
///
/// Interrupt vectors and software events land here; handlers run to
/// completion on the owning CPU's dispatcher, one at a time.
pub trait EventDemux: Send + Sync {
    /// Reserve an event slot without a handler.
    fn reserve(&self) -> IrqToken;
    /// Install a handler on a previously reserved slot.
    fn install(&self, token: IrqToken, handler: EventHandler);
    /// Reserve a slot and install a handler in one step.
    fn subscribe(&self, handler: EventHandler) -> IrqToken {
        let token = self.reserve();
        self.install(token, handler);
        token
    }
    /// Mark an event pending; the dispatcher runs its handler later.
    fn trigger(&self, token: IrqToken);
    /// Id of the CPU this dispatcher serves.
    fn current_cpu(&self) -> u32;
}

/// A slab-style store of fixed-size packet buffers.
pub trait BufferStore: Send + Sync {
    /// Take a free buffer, or `None` when the store is exhausted.
    fn get_buffer(&self) -> Option<NonNull<u8>>;
    /// Return a buffer previously handed out by [`get_buffer`].
    ///
    /// [`get_buffer`]: BufferStore::get_buffer
    fn release(&self, buf: NonNull<u8>);
    /// Size of every buffer in the store.
    fn bufsize(&self) -> usize;
    /// Number of buffers currently handed out.
    fn buffers_in_use(&self) -> usize;
    /// Reattach the store to the calling CPU after a migration.
    fn move_to_this_cpu(&self);
}

/// Callbacks the driver makes into the layer above it.
pub trait LinkLayer: Send + Sync {
    /// Deliver a received frame upward.
    fn receive(&self, packet: Packet);
    /// Announce that `tokens` transmit slots are now free.
    fn transmit_queue_available_event(&self, tokens: usize);
    /// Admission predicate for RX refill: may the driver take more buffers?
    fn buffers_still_available(&self, in_use: usize) -> bool {
        let _ = in_use;
        true
    }
    /// Admission predicate for the send queue at the given depth.
    fn sendq_still_available(&self, depth: usize) -> bool {
        let _ = depth;
        true
    }
    /// Whether anything upstream is waiting for transmit capacity.
    ///
    /// Gates the driver's synchronous poll loop.
    fn awaiting_transmit_capacity(&self) -> bool {
        false
    }
}

/// The capability set a network device driver presents to the stack.
pub trait Nic: Send + Sync {
    /// Human readable driver name.
    fn driver_name(&self) -> &'static str;
    /// Instance name, e.g. `eth0`.
    fn device_name(&self) -> &str;
    /// Hardware address.
    fn mac(&self) -> MacAddr;
    /// Configured MTU.
    fn mtu(&self) -> u16;
    /// Largest link-layer frame the device accepts.
    fn max_packet_len(&self) -> u16;
    /// Attach the upstream link layer receiving from this device.
    fn set_link_layer(&self, upstream: Arc<dyn LinkLayer>);
    /// Queue an outbound packet chain.
    fn transmit(&self, packet: Packet);
    /// Publish any pending producer advance to the device.
    fn flush(&self);
    /// Synchronously drain RX and TX work until none remains.
    fn poll(&self);
    /// Space available in the transmit queue, in packets.
    fn transmit_queue_available(&self) -> usize;
    /// Allocate an empty outbound packet with the given link-layer offset.
    fn create_packet(&self, link_offset: usize) -> Option<Packet>;
    /// Mask interrupts and reset the device, returning in-flight buffers.
    fn deactivate(&self);
    /// Rebind the device's buffers and interrupt vectors to this CPU.
    fn move_to_this_cpu(&self);
}

/// A transmit entry point handed to the layer above.
pub type Downstream = Box<dyn Fn(Packet) + Send + Sync>;

/// Factory signature registered with the PCI manager.
pub type NicFactory = fn(Arc<dyn PciHandle>, u16) -> Result<Arc<dyn Nic>, DriverError>;

//! smoltcp binding for the NIC.
//!
//! [`PhyDevice`] implements `smoltcp::phy::Device` on top of any [`Nic`],
//! so the driver plugs straight into a smoltcp `Interface`. Inbound frames
//! are queued by the adapter half (which the NIC calls as its link layer);
//! outbound frames are written directly into driver buffers, so the
//! transmit side stays zero-copy.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use spin::Mutex;

use vmxnet3_hal::{LinkLayer, Nic, Packet};

/// Inbound frames held for the interface before it polls.
const RX_QUEUE_CAPACITY: usize = 256;

/// Send-queue depth admitted into the driver.
const SENDQ_LIMIT: usize = 1024;

/// Buffers the stack may hold before RX refill is throttled.
const BUFFERS_LIMIT: usize = 4096;

/// The NIC-facing half: receives frames and answers admission queries.
pub struct EthernetAdapter {
    rx_queue: Mutex<VecDeque<Packet>>,
}

impl LinkLayer for EthernetAdapter {
    fn receive(&self, packet: Packet) {
        let mut queue = self.rx_queue.lock();
        if queue.len() < RX_QUEUE_CAPACITY {
            queue.push_back(packet);
        }
        // Overflow drops the frame; the buffer goes back to the store.
    }

    fn transmit_queue_available_event(&self, _tokens: usize) {}

    fn buffers_still_available(&self, in_use: usize) -> bool {
        in_use < BUFFERS_LIMIT
    }

    fn sendq_still_available(&self, depth: usize) -> bool {
        depth < SENDQ_LIMIT
    }
}

/// A smoltcp `Device` over a [`Nic`].
pub struct PhyDevice {
    nic: Arc<dyn Nic>,
    adapter: Arc<EthernetAdapter>,
}

impl PhyDevice {
    /// Bind the NIC to a new adapter and return the smoltcp device.
    pub fn new(nic: Arc<dyn Nic>) -> PhyDevice {
        let adapter = Arc::new(EthernetAdapter {
            rx_queue: Mutex::new(VecDeque::with_capacity(RX_QUEUE_CAPACITY)),
        });
        nic.set_link_layer(adapter.clone());
        PhyDevice { nic, adapter }
    }

    /// MAC address of the underlying NIC.
    pub fn mac_address(&self) -> [u8; 6] {
        *self.nic.mac().as_bytes()
    }
}

/// Receive token wrapping one delivered packet.
pub struct PacketRxToken {
    packet: Packet,
}

impl RxToken for PacketRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(self.packet.payload_mut())
    }
}

/// Transmit token writing straight into a driver buffer.
pub struct NicTxToken<'a> {
    nic: &'a Arc<dyn Nic>,
}

impl<'a> TxToken for NicTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        match self.nic.create_packet(0) {
            Some(mut packet) => {
                packet.set_len(len);
                let result = f(packet.payload_mut());
                self.nic.transmit(packet);
                result
            }
            None => {
                // No buffer available; build the frame in scratch memory
                // and drop it, as a full NIC would.
                let mut scratch = alloc::vec![0u8; len];
                f(&mut scratch)
            }
        }
    }
}

impl Device for PhyDevice {
    type RxToken<'a> = PacketRxToken where Self: 'a;
    type TxToken<'a> = NicTxToken<'a> where Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.adapter.rx_queue.lock().pop_front()?;
        Some((PacketRxToken { packet }, NicTxToken { nic: &self.nic }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.nic.transmit_queue_available() > 0 {
            Some(NicTxToken { nic: &self.nic })
        } else {
            None
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.nic.mtu() as usize;
        caps.max_burst_size = Some(1);
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bufstore::BufferPool;
    use crate::device::{DRIVER_OFFSET, PACKET_HEADROOM};
    use alloc::vec::Vec;
    use vmxnet3_common::MacAddr;
    use vmxnet3_hal::BufferStore;

    /// A NIC stub that loops transmitted frames into a log.
    struct StubNic {
        pool: Arc<BufferPool>,
        sent: Mutex<Vec<Vec<u8>>>,
        upstream: Mutex<Option<Arc<dyn LinkLayer>>>,
    }

    impl StubNic {
        fn new() -> Arc<StubNic> {
            Arc::new(StubNic {
                pool: BufferPool::new(8, 2048),
                sent: Mutex::new(Vec::new()),
                upstream: Mutex::new(None),
            })
        }

        fn inject_rx(&self, data: &[u8]) {
            let buf = self.pool.get_buffer().unwrap();
            // SAFETY: fresh buffer from the stub's own pool.
            let mut packet = unsafe {
                Packet::from_raw(
                    buf,
                    (PACKET_HEADROOM + DRIVER_OFFSET) as u32,
                    0,
                    self.pool.clone(),
                )
            };
            packet.set_len(data.len());
            packet.payload_mut().copy_from_slice(data);
            let upstream = self.upstream.lock().clone().unwrap();
            upstream.receive(packet);
        }
    }

    impl Nic for StubNic {
        fn driver_name(&self) -> &'static str {
            "stub"
        }
        fn device_name(&self) -> &str {
            "eth-test"
        }
        fn mac(&self) -> MacAddr {
            MacAddr([2, 0, 0, 0, 0, 1])
        }
        fn mtu(&self) -> u16 {
            1500
        }
        fn max_packet_len(&self) -> u16 {
            1518
        }
        fn set_link_layer(&self, upstream: Arc<dyn LinkLayer>) {
            *self.upstream.lock() = Some(upstream);
        }
        fn transmit(&self, packet: Packet) {
            self.sent.lock().push(packet.payload().to_vec());
        }
        fn flush(&self) {}
        fn poll(&self) {}
        fn transmit_queue_available(&self) -> usize {
            4
        }
        fn create_packet(&self, link_offset: usize) -> Option<Packet> {
            let buf = self.pool.get_buffer()?;
            let offset = (PACKET_HEADROOM + DRIVER_OFFSET + link_offset) as u32;
            // SAFETY: fresh buffer from the stub's own pool.
            Some(unsafe { Packet::from_raw(buf, offset, 0, self.pool.clone()) })
        }
        fn deactivate(&self) {}
        fn move_to_this_cpu(&self) {}
    }

    #[test]
    fn test_transmit_token_writes_frame() {
        let nic = StubNic::new();
        let mut phy = PhyDevice::new(nic.clone());

        let token = phy.transmit(Instant::from_millis(0)).unwrap();
        token.consume(4, |frame| frame.copy_from_slice(&[9, 8, 7, 6]));

        assert_eq!(nic.sent.lock().clone(), alloc::vec![alloc::vec![9u8, 8, 7, 6]]);
    }

    #[test]
    fn test_receive_token_yields_frame() {
        let nic = StubNic::new();
        let mut phy = PhyDevice::new(nic.clone());
        assert!(phy.receive(Instant::from_millis(0)).is_none());

        nic.inject_rx(&[1, 2, 3]);
        let (rx, _tx) = phy.receive(Instant::from_millis(0)).unwrap();
        rx.consume(|frame| assert_eq!(&frame[..], &[1u8, 2, 3][..]));
    }

    #[test]
    fn test_capabilities_follow_nic() {
        let nic = StubNic::new();
        let phy = PhyDevice::new(nic);
        let caps = phy.capabilities();
        assert_eq!(caps.max_transmission_unit, 1500);
        assert_eq!(caps.medium, Medium::Ethernet);
    }
}

//! PCI driver registration table.
//!
//! Drivers register a factory against a (vendor, product) pair at startup;
//! PCI enumeration then asks this table for a factory to instantiate when
//! it finds a matching function.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use lazy_static::lazy_static;
use spin::Mutex;

use vmxnet3_common::DriverError;
use vmxnet3_hal::{Nic, NicFactory, PciHandle};

lazy_static! {
    /// Factories keyed by (vendor id, product id).
    static ref DRIVER_TABLE: Mutex<BTreeMap<(u16, u16), NicFactory>> =
        Mutex::new(BTreeMap::new());
}

/// Register a NIC factory for a PCI (vendor, product) pair.
pub fn register_driver(vendor: u16, product: u16, factory: NicFactory) {
    DRIVER_TABLE.lock().insert((vendor, product), factory);
}

/// Look up the factory registered for a (vendor, product) pair.
pub fn lookup(vendor: u16, product: u16) -> Option<NicFactory> {
    DRIVER_TABLE.lock().get(&(vendor, product)).copied()
}

/// Instantiate a driver for a discovered function, if one is registered.
pub fn probe(
    pci: Arc<dyn PciHandle>,
    mtu: u16,
) -> Option<Result<Arc<dyn Nic>, DriverError>> {
    let factory = lookup(pci.vendor_id(), pci.product_id())?;
    Some(factory(pci, mtu))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_factory(
        _pci: Arc<dyn PciHandle>,
        _mtu: u16,
    ) -> Result<Arc<dyn Nic>, DriverError> {
        Err(DriverError::UnsupportedDevice)
    }

    #[test]
    fn test_register_and_lookup() {
        register_driver(0x1234, 0x5678, failing_factory);
        assert!(lookup(0x1234, 0x5678).is_some());
        assert!(lookup(0x1234, 0x0001).is_none());
    }
}

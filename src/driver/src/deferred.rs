//! Process-wide registry of devices with a pending doorbell write.
//!
//! Transmitting devices register themselves here instead of ringing the TX
//! doorbell inline; the dispatcher later runs [`handle_deferred`], which
//! flushes every registered device exactly once. Batching the MMIO write
//! across many transmissions is the whole point.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::Vmxnet3;

/// Devices whose producer cursors moved since their last doorbell.
static DEFERRED_DEVS: Mutex<Vec<Arc<Vmxnet3>>> = Mutex::new(Vec::new());

/// Add a device to the pending set.
pub(crate) fn register(dev: Arc<Vmxnet3>) {
    DEFERRED_DEVS.lock().push(dev);
}

/// Flush every registered device and clear the set.
///
/// Runs on the same dispatcher that the producers run on, so registration
/// and draining never race.
pub fn handle_deferred() {
    let devs = core::mem::take(&mut *DEFERRED_DEVS.lock());
    for dev in devs {
        dev.flush_now();
        dev.clear_kick();
    }
}

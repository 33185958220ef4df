//! Driver-wide error types.

use core::fmt;

/// Errors surfaced by NIC driver construction and activation.
///
/// Hot-path conditions (refill denial, send-queue overflow) are not errors
/// in the `Result` sense; they are recorded into statistics counters and
/// recovered locally. Only construction and activation propagate failure.
/// A link that is down at probe time is not a failure either: construction
/// completes and the device stays idle until the link comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Wrong PCI revision, or the device does not support version 1.
    UnsupportedDevice,
    /// The device lacks an MSI-X capability (legacy IRQs are unsupported).
    NoMsix,
    /// The activation command returned a nonzero status.
    ActivationFailed,
    /// A required BAR was missing or not a memory BAR.
    BadBar,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::UnsupportedDevice => write!(f, "unsupported device or version"),
            DriverError::NoMsix => write!(f, "device has no MSI-X capability"),
            DriverError::ActivationFailed => write!(f, "device activation failed"),
            DriverError::BadBar => write!(f, "missing or invalid PCI BAR"),
        }
    }
}

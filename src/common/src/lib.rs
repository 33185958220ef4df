//! Shared leaf types for the vmxnet3 driver workspace.
//!
//! This crate holds the types every other member depends on: the driver
//! error enum, the Ethernet MAC address type, and the named-counter
//! statistics registry.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod error;
pub mod mac;
pub mod stats;

pub use error::DriverError;
pub use mac::MacAddr;

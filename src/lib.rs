//! Resilient event transport for a BLE remote control.
//!
//! Discovers the remote, subscribes to its event characteristic, verifies
//! that notifications really flow, and delivers each reassembled,
//! de-duplicated event to the application exactly once.

pub mod domain;
pub mod infrastructure;

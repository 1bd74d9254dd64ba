//! Bluetooth Module
//!
//! Resilient BLE transport for the event remote.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       LinkService                        │
//! │      (public handle: commands in, AppEvents out)         │
//! └────────────────────────────┬─────────────────────────────┘
//!                              │ LinkInput queue
//!                              ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     LinkSupervisor                       │
//! │   (single owner loop: lifecycle, timers, data path)      │
//! └──┬──────────────┬──────────────┬──────────────┬──────────┘
//!    │              │              │              │
//!    ▼              ▼              ▼              ▼
//! ┌─────────┐ ┌───────────┐ ┌────────────┐ ┌─────────────┐
//! │ Scanner │ │ Handshake │ │  Polling   │ │ Reassembly, │
//! │         │ │ - CCCD    │ │ - trigger  │ │ duplicates, │
//! │         │ │ - verify  │ │   + read   │ │ codec       │
//! └─────────┘ └───────────┘ └────────────┘ └─────────────┘
//!                              │
//!                              ▼
//!                   RadioStack (WinRT, or a fake in tests)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, known names and descriptor values
//! - [`radio`] - the radio interface and its event types
//! - [`timers`] - generation-tagged cancellable timers
//! - [`scanner`] - advertisement matching
//! - [`handshake`] - notification subscription and verification
//! - [`polling`] - trigger-and-read fallback
//! - [`supervisor`] - the connection state machine
//! - [`service`] - application-facing handle

pub mod handshake;
pub mod polling;
pub mod protocol;
pub mod radio;
pub mod scanner;
pub mod service;
pub mod supervisor;
pub mod timers;
#[cfg(windows)]
pub mod winrt;

pub use service::{LinkQueue, LinkService};
pub use supervisor::LinkConfig;

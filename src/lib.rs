//! Host-side Bluetooth HCI transport.
//!
//! Multiplexes HCI command/event transactions and flow-controls outbound ACL
//! data packets over a single transport to a Bluetooth controller
//! ([Vol 4] Part E, Sections 4.1 - 4.4).

#[path = "hci/hci.rs"]
pub mod hci;
#[path = "host/host.rs"]
pub mod host;
pub mod le;
#[path = "util/util.rs"]
mod util;

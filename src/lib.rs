//! colod: control-plane daemon for a QEMU COLO high-availability pair.
//!
//! One daemon runs beside each QEMU of a primary/secondary pair. It drives
//! its QEMU through live migration into COLO replication, watches the peer
//! daemon over a totally-ordered cluster group channel, decides when a
//! failover must happen and arbitrates which side wins if both try at once.

pub mod channel;
pub mod client;
pub mod cluster;
pub mod commands;
pub mod daemon;
pub mod error;
pub mod events;
pub mod format;
pub mod json;
pub mod peer;
pub mod qmp;
pub mod watchdog;

pub use error::{ColodError, Result};

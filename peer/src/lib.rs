//! # Peer Runtime
//!
//! Runs a [`engine::RaceEngine`] against a room channel. The channel
//! implementation here is in-process ([`bus::MemoryBus`]), which is enough
//! to exercise every synchronization path the engine has: fan-out with
//! self-echo, per-sender ordering, presence snapshots, and abrupt peer
//! loss. The [`driver::PeerDriver`] is the only place that touches async.

pub mod bus;
pub mod driver;

pub use bus::{BusHandle, MemoryBus};
pub use driver::{now_ms, PeerDriver};

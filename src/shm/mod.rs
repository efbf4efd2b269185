//! Shared-memory frame transport.
//!
//! Three layers, bottom up:
//!
//! - [`layout`]: the bit-exact on-memory format, control block, metadata
//!   JSON area, slot array.
//! - [`region`]: named mapped regions over the four OS backings, with the
//!   producer/consumer lifecycle handshake.
//! - [`ring`]: the lock-free single-producer / multi-consumer protocol
//!   driven over a region.

pub mod layout;
pub mod region;
pub mod ring;

pub use layout::{ControlBlock, FrameHeader, RegionMetadata};
pub use region::{RegionStats, SharedMemoryRegion};
pub use ring::{ConsumerCallback, RingConsumer, RingProducer};

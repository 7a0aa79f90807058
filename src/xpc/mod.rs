mod activation;
mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fabric;
mod heartbeat;
pub mod machine;
mod notify;
pub mod partition;
mod queue;
pub mod registry;
pub mod reserved;
mod wire;
mod workers;

// Every remote partition gets its own long-lived task. It first runs the
// activation handshake and then stays on as the partition's channel manager,
// the only task that opens and closes channels towards that partition. All
// partitions proceed independently of each other; nothing locks across them.

// Delivery is delegated to short-lived worker tasks per channel so a slow
// callback never holds up the manager. The manager only pulls the peer's
// indices, works out how many messages wait, and asks the channel's pool for
// that many workers.

// Signalling across the partition boundary is lossy on purpose. A sender sets
// a bit in the doorbell word the receiver keeps for it and then fires an
// interrupt that may never arrive. Receivers treat the interrupt as a hint and
// rescan the doorbells on a timer, so a lost interrupt costs latency and
// nothing else.

pub type PartId = u16;
pub type ChannelId = u8;

/// Channel numbers available per partition pair.
pub const MAX_CHANNELS: usize = 8;

/// Doorbell bit for the first-contact handshake; channels use bits 0..8.
pub(crate) const DESCRIPTOR_BIT: u64 = 1 << 63;

pub(crate) fn channel_bit(channel: ChannelId) -> u64 {
    1 << channel
}

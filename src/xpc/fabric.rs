// The fabric is everything below the messaging core: the memory other
// partitions can read, the atomic doorbell words, and the interrupt line. How
// bytes physically cross the partition boundary is not our concern; the core
// only relies on the contract below. A partition only ever writes its own
// memory and pulls copies of everyone else's.

use tokio::sync::mpsc;

use super::{error::Result, ChannelId, PartId};

/// A named piece of partition memory that peers may pull.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Region {
    /// The first-contact block this partition publishes for `peer`.
    Descriptor { peer: PartId },
    /// Open/close state of a channel towards `peer`.
    ChannelCtl { peer: PartId, channel: ChannelId },
    /// The get/put index pair of a channel towards `peer`.
    Gp { peer: PartId, channel: ChannelId },
    /// The outbound message ring of a channel towards `peer`.
    Slots { peer: PartId, channel: ChannelId },
}

pub trait Fabric: Send + Sync + 'static {
    /// ID of the partition this handle belongs to.
    fn local(&self) -> PartId;

    /// Number of possible partition IDs, including the local one.
    fn partitions(&self) -> PartId;

    fn publish_reserved_page(&self, page: &[u8]) -> Result<()>;

    fn retract_reserved_page(&self);

    /// Reads the reserved page of `partid`. Fails with `PartitionDown` when
    /// the partition can't be reached or has nothing published.
    fn reserved_page(&self, partid: PartId) -> Result<Vec<u8>>;

    /// Location of the local heartbeat word, advertised in the reserved page.
    fn vars_location(&self) -> u64;

    fn set_heartbeat(&self, value: u64);

    /// Reads a remote heartbeat word. A stale `location` (the remote rebooted)
    /// fails like an unreachable remote.
    fn heartbeat(&self, partid: PartId, location: u64) -> Result<u64>;

    /// Allocates a zeroed local region, replacing any previous contents.
    fn alloc(&self, region: Region, len: usize) -> Result<()>;

    /// Writes into a local region, growing it as needed.
    fn write(&self, region: Region, offset: usize, bytes: &[u8]) -> Result<()>;

    fn free(&self, region: Region);

    /// Copies `len` bytes out of a region of `partid`. `Ok(None)` means the
    /// remote is reachable but has not published the region.
    fn pull(
        &self,
        partid: PartId,
        region: Region,
        offset: usize,
        len: usize,
    ) -> Result<Option<Vec<u8>>>;

    /// Atomically ORs `bits` into the doorbell word `partid` keeps for us and
    /// returns the bits that were already set.
    fn ring(&self, partid: PartId, bits: u64) -> Result<u64>;

    /// Reads and clears the local doorbell word kept for `source`.
    fn take_doorbell(&self, source: PartId) -> u64;

    /// Best-effort interrupt towards `partid`. It may be lost or overtake the
    /// doorbell write it announces.
    fn interrupt(&self, partid: PartId);

    /// Hands out the receiving end of the local interrupt line, once.
    fn take_interrupts(&self) -> Option<mpsc::UnboundedReceiver<PartId>>;
}

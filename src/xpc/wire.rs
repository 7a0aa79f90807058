use byteorder::{ByteOrder, LittleEndian};
use rkyv::{
    bytecheck::CheckBytes, from_bytes, to_bytes, validation::validators::DefaultValidator,
    AlignedVec, Archive, Deserialize, Serialize,
};

use super::{
    error::{Error, Result},
    PartId,
};

/// Descriptors are published as `len | archive`, zero padded to this size so
/// a peer can pull one with a single copy.
pub const FRAME_LEN: usize = 128;

pub const GP_LEN: usize = 16;

pub const SLOT_HEADER_LEN: usize = 16;

/// Slot flag: the producer finished writing this slot.
pub const SLOT_READY: u8 = 0b0000_0001;
/// Slot flag: the reservation was abandoned, skip it without a callout.
pub const SLOT_NOOP: u8 = 0b0000_0010;

/// Where a partition is in its half of the first-contact handshake.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum Stage {
    Setup,
    Active,
    Teardown,
}

/// The first-contact block a partition publishes for one peer.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PartDescriptor {
    pub version: u16,
    /// The publishing partition.
    pub partid: PartId,
    /// The partition this block is meant for.
    pub peer: PartId,
    /// Boot stamp of the publisher.
    pub stamp: i64,
    /// Boot stamp of `peer` as seen by the publisher.
    pub peer_stamp: i64,
    pub stage: Stage,
}

/// Open/close state of one side of a channel. Each side acknowledges the
/// other's generation; the channel is connected when both are open and
/// acknowledge each other's current generation.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ChannelCtl {
    pub open: bool,
    pub generation: u32,
    pub ack: u32,
    pub payload_size: u32,
    pub depth: u32,
}

pub fn encode_frame<T>(value: &T) -> Result<Vec<u8>>
where
    T: Serialize<rkyv::ser::serializers::AllocSerializer<FRAME_LEN>>,
{
    let archived = to_bytes::<_, FRAME_LEN>(value).map_err(|_| Error::CorruptDescriptor)?;
    if archived.len() + 4 > FRAME_LEN {
        return Err(Error::CorruptDescriptor);
    }
    let mut buf = vec![0u8; FRAME_LEN];
    LittleEndian::write_u32(&mut buf[0..4], archived.len() as u32);
    buf[4..4 + archived.len()].copy_from_slice(&archived);
    Ok(buf)
}

pub fn decode_frame<T>(buf: &[u8]) -> Result<T>
where
    T: Archive + 'static,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, rkyv::de::deserializers::SharedDeserializeMap>,
{
    if buf.len() < 4 {
        return Err(Error::CorruptDescriptor);
    }
    let len = LittleEndian::read_u32(&buf[0..4]) as usize;
    let body = buf.get(4..4 + len).ok_or(Error::CorruptDescriptor)?;
    // archives need their natural alignment, which a pulled Vec<u8> doesn't
    // promise
    let mut aligned = AlignedVec::with_capacity(len);
    aligned.extend_from_slice(body);
    from_bytes::<T>(&aligned).map_err(|_| Error::CorruptDescriptor)
}

/// `get` is how far the publisher consumed the peer's queue, `put` how far
/// it produced into its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetPut {
    pub get: u64,
    pub put: u64,
}

impl GetPut {
    pub fn encode(&self) -> [u8; GP_LEN] {
        let mut buf = [0u8; GP_LEN];
        LittleEndian::write_u64(&mut buf[0..8], self.get);
        LittleEndian::write_u64(&mut buf[8..16], self.put);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < GP_LEN {
            return Err(Error::CorruptDescriptor);
        }
        Ok(Self {
            get: LittleEndian::read_u64(&buf[0..8]),
            put: LittleEndian::read_u64(&buf[8..16]),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotHeader {
    pub seq: u64,
    pub flags: u8,
}

impl SlotHeader {
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.seq);
        buf[8] = self.flags;
        buf[9..SLOT_HEADER_LEN].fill(0);
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < SLOT_HEADER_LEN {
            return Err(Error::CorruptDescriptor);
        }
        Ok(Self {
            seq: LittleEndian::read_u64(&buf[0..8]),
            flags: buf[8],
        })
    }
}

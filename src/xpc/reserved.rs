//! The reserved page is the only structure other partitions parse directly,
//! so its layout is fixed and little endian:
//!
//! ```text
//! 0   magic "GNGL"         4
//! 4   version              2   major << 8 | minor
//! 6   partition id         2
//! 8   boot stamp           8   µs since the Unix epoch
//! 16  vars location        8   where the heartbeat word lives
//! 24  location descriptor  8
//! 32  max channels         2
//! 34  reserved            14   zero
//! 48  digest              16   blake3(bytes 0..48), truncated
//! ```

use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::{
    error::{Error, Result},
    PartId,
};

pub const RESERVED_PAGE_LEN: usize = 64;
pub const MAGIC: [u8; 4] = *b"GNGL";
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

const DIGEST_OFFSET: usize = 48;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedPage {
    pub version: u16,
    pub partid: PartId,
    pub stamp: i64,
    pub vars_location: u64,
    pub location: u64,
    pub max_channels: u16,
}

impl ReservedPage {
    pub fn new(
        partid: PartId,
        stamp: i64,
        vars_location: u64,
        location: u64,
        max_channels: u16,
    ) -> Self {
        Self {
            version: (VERSION_MAJOR as u16) << 8 | VERSION_MINOR as u16,
            partid,
            stamp,
            vars_location,
            location,
            max_channels,
        }
    }

    pub fn major(&self) -> u8 {
        (self.version >> 8) as u8
    }

    pub fn encode(&self) -> [u8; RESERVED_PAGE_LEN] {
        let mut buf = [0u8; RESERVED_PAGE_LEN];
        buf[0..4].copy_from_slice(&MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], self.version);
        LittleEndian::write_u16(&mut buf[6..8], self.partid);
        LittleEndian::write_i64(&mut buf[8..16], self.stamp);
        LittleEndian::write_u64(&mut buf[16..24], self.vars_location);
        LittleEndian::write_u64(&mut buf[24..32], self.location);
        LittleEndian::write_u16(&mut buf[32..34], self.max_channels);
        let digest = blake3::hash(&buf[..DIGEST_OFFSET]);
        buf[DIGEST_OFFSET..].copy_from_slice(&digest.as_bytes()[..16]);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESERVED_PAGE_LEN {
            return Err(Error::CorruptDescriptor);
        }
        let buf = array_ref![bytes, 0, RESERVED_PAGE_LEN];
        if buf[0..4] != MAGIC {
            debug!("reserved page has bad magic {:02x?}", &buf[0..4]);
            return Err(Error::CorruptDescriptor);
        }
        let digest = blake3::hash(&buf[..DIGEST_OFFSET]);
        if digest.as_bytes()[..16] != buf[DIGEST_OFFSET..] {
            debug!(
                "reserved page digest {:02x?} does not match contents",
                &buf[DIGEST_OFFSET..]
            );
            return Err(Error::CorruptDescriptor);
        }
        let page = Self {
            version: LittleEndian::read_u16(&buf[4..6]),
            partid: LittleEndian::read_u16(&buf[6..8]),
            stamp: LittleEndian::read_i64(&buf[8..16]),
            vars_location: LittleEndian::read_u64(&buf[16..24]),
            location: LittleEndian::read_u64(&buf[24..32]),
            max_channels: LittleEndian::read_u16(&buf[32..34]),
        };
        if page.major() != VERSION_MAJOR {
            return Err(Error::ProtocolVersionMismatch);
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        let page = ReservedPage::new(3, 0x0102, 0xAA, 0xF0, 8);
        let buf = page.encode();
        assert_eq!(&buf[0..4], b"GNGL");
        assert_eq!(&buf[4..6], &[VERSION_MINOR, VERSION_MAJOR]);
        assert_eq!(&buf[6..8], &[3, 0]);
        assert_eq!(&buf[8..10], &[0x02, 0x01]);
        assert_eq!(buf[16], 0xAA);
        assert_eq!(buf[24], 0xF0);
        assert_eq!(&buf[32..34], &[8, 0]);
        assert!(buf[34..48].iter().all(|b| *b == 0));
        assert_eq!(ReservedPage::decode(&buf), Ok(page));
    }

    #[test]
    fn tampering_is_detected() {
        let mut buf = ReservedPage::new(1, 5, 6, 7, 8).encode();
        buf[17] ^= 0xFF;
        assert_eq!(ReservedPage::decode(&buf), Err(Error::CorruptDescriptor));
        assert_eq!(ReservedPage::decode(&buf[..10]), Err(Error::CorruptDescriptor));
    }

    #[test]
    fn foreign_major_version_is_rejected() {
        let mut page = ReservedPage::new(1, 5, 6, 7, 8);
        page.version = ((VERSION_MAJOR as u16) + 1) << 8;
        assert_eq!(
            ReservedPage::decode(&page.encode()),
            Err(Error::ProtocolVersionMismatch)
        );
    }
}

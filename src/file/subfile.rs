//! Subfile names, flags, and directory entries.

use byteorder::{ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Maximum number of subfiles one archive file can hold.
pub const MAX_SUBFILES: usize = 64;

/// Serialized size of a [`SubFileHeader`] inside the file header body.
pub(crate) const SUBFILE_HEADER_LEN: usize = 54;

/// A 20-byte subfile name: two 64-bit words and one 32-bit word.
///
/// Names are not strings; they are the SHA-1 of a canonical byte
/// sequence describing what the subfile holds, so equal inputs always
/// produce equal names and collisions are not a practical concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubFileName {
    pub word0: u64,
    pub word1: u64,
    pub word2: u32,
}

impl SubFileName {
    fn from_digest(digest: &[u8]) -> Self {
        Self {
            word0: LittleEndian::read_u64(&digest[0..8]),
            word1: LittleEndian::read_u64(&digest[8..16]),
            word2: LittleEndian::read_u32(&digest[16..20]),
        }
    }

    /// Derives a name from three GUIDs.
    pub fn from_uuid_triple(first: Uuid, second: Uuid, third: Uuid) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(first.as_bytes());
        hasher.update(second.as_bytes());
        hasher.update(third.as_bytes());
        Self::from_digest(&hasher.finalize())
    }

    /// Derives a name from a logical table name and its key/value types.
    pub fn from_table(name: &str, key_type: Uuid, value_type: Uuid) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(key_type.as_bytes());
        hasher.update(value_type.as_bytes());
        Self::from_digest(&hasher.finalize())
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.word0);
        LittleEndian::write_u64(&mut buf[8..16], self.word1);
        LittleEndian::write_u32(&mut buf[16..20], self.word2);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            word0: LittleEndian::read_u64(&buf[0..8]),
            word1: LittleEndian::read_u64(&buf[8..16]),
            word2: LittleEndian::read_u32(&buf[16..20]),
        }
    }
}

/// Per-subfile flags stored in the directory entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubFileFlags {
    pub read_only: bool,
    pub simplified: bool,
}

impl SubFileFlags {
    const READ_ONLY: u32 = 1 << 0;
    const SIMPLIFIED: u32 = 1 << 1;

    fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.read_only {
            bits |= Self::READ_ONLY;
        }
        if self.simplified {
            bits |= Self::SIMPLIFIED;
        }
        bits
    }

    fn from_bits(bits: u32) -> Self {
        Self {
            read_only: bits & Self::READ_ONLY != 0,
            simplified: bits & Self::SIMPLIFIED != 0,
        }
    }
}

/// One entry in the archive's subfile directory.
///
/// The five root addresses anchor the indirect block tree; zero means
/// the tier has never been populated. `data_block_count` counts data
/// blocks only, `total_block_count` also counts indirect blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubFileHeader {
    pub file_id: u16,
    pub name: SubFileName,
    pub flags: SubFileFlags,
    pub direct_block: u32,
    pub single_indirect_block: u32,
    pub double_indirect_block: u32,
    pub triple_indirect_block: u32,
    pub quadruple_indirect_block: u32,
    pub data_block_count: u32,
    pub total_block_count: u32,
}

impl SubFileHeader {
    pub fn new(file_id: u16, name: SubFileName) -> Self {
        Self {
            file_id,
            name,
            flags: SubFileFlags::default(),
            direct_block: 0,
            single_indirect_block: 0,
            double_indirect_block: 0,
            triple_indirect_block: 0,
            quadruple_indirect_block: 0,
            data_block_count: 0,
            total_block_count: 0,
        }
    }

    pub(crate) fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.file_id);
        self.name.write_to(&mut buf[2..22]);
        LittleEndian::write_u32(&mut buf[22..26], self.flags.to_bits());
        LittleEndian::write_u32(&mut buf[26..30], self.direct_block);
        LittleEndian::write_u32(&mut buf[30..34], self.single_indirect_block);
        LittleEndian::write_u32(&mut buf[34..38], self.double_indirect_block);
        LittleEndian::write_u32(&mut buf[38..42], self.triple_indirect_block);
        LittleEndian::write_u32(&mut buf[42..46], self.quadruple_indirect_block);
        LittleEndian::write_u32(&mut buf[46..50], self.data_block_count);
        LittleEndian::write_u32(&mut buf[50..54], self.total_block_count);
    }

    pub(crate) fn read_from(buf: &[u8]) -> Self {
        Self {
            file_id: LittleEndian::read_u16(&buf[0..2]),
            name: SubFileName::read_from(&buf[2..22]),
            flags: SubFileFlags::from_bits(LittleEndian::read_u32(&buf[22..26])),
            direct_block: LittleEndian::read_u32(&buf[26..30]),
            single_indirect_block: LittleEndian::read_u32(&buf[30..34]),
            double_indirect_block: LittleEndian::read_u32(&buf[34..38]),
            triple_indirect_block: LittleEndian::read_u32(&buf[38..42]),
            quadruple_indirect_block: LittleEndian::read_u32(&buf[42..46]),
            data_block_count: LittleEndian::read_u32(&buf[46..50]),
            total_block_count: LittleEndian::read_u32(&buf[50..54]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_deterministic_and_distinct() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let c = Uuid::from_u128(3);
        assert_eq!(
            SubFileName::from_uuid_triple(a, b, c),
            SubFileName::from_uuid_triple(a, b, c)
        );
        assert_ne!(
            SubFileName::from_uuid_triple(a, b, c),
            SubFileName::from_uuid_triple(a, c, b)
        );
        assert_ne!(
            SubFileName::from_table("points", a, b),
            SubFileName::from_table("points2", a, b)
        );
    }

    #[test]
    fn directory_entry_round_trips() {
        let mut header = SubFileHeader::new(
            7,
            SubFileName::from_table("points", Uuid::from_u128(1), Uuid::from_u128(2)),
        );
        header.flags.simplified = true;
        header.direct_block = 11;
        header.double_indirect_block = 92;
        header.data_block_count = 40;
        header.total_block_count = 44;

        let mut buf = [0u8; SUBFILE_HEADER_LEN];
        header.write_to(&mut buf);
        assert_eq!(SubFileHeader::read_from(&buf), header);
    }
}

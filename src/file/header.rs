//! The archive file header block.
//!
//! One serialized header describes an entire archive generation: block
//! size, allocation high-water mark, snapshot sequence number, the
//! subfile directory, flag ids, and an extensible attribute stream.
//! Commit replaces the whole header; nothing in it is ever patched in
//! place. The first `header_block_count` physical blocks of the file
//! are reserved as header replicas.

use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use super::{
    subfile::{SubFileHeader, SubFileName, SUBFILE_HEADER_LEN},
    FileError, MAX_SUBFILES,
};
use crate::encoding::{push_7bit_u64, read_7bit_u64};
use crate::io::{MAX_BLOCK_SIZE_LOG2, MIN_BLOCK_SIZE_LOG2};

/// Header version this build writes.
pub const HEADER_VERSION: i16 = 2;

/// Number of header replicas in full mode / simplified mode.
const FULL_HEADER_BLOCK_COUNT: u32 = 10;
const SIMPLIFIED_HEADER_BLOCK_COUNT: u32 = 1;

const MAGIC: &[u8; 26] = b"openHistorian 2.0 Archive\0";
const ENDIAN_MARKER: u8 = b'L';

/// Attribute stream tags.
const TAG_END_OF_ATTRIBUTES: u8 = 0;
const TAG_FLAG_IDS: u8 = 1;
const TAG_USER_ATTRIBUTES: u8 = 2;

/// In-memory form of the archive file header.
///
/// A header is either read-only (a committed generation) or editable
/// (the single in-flight generation of an edit session). Editable
/// clones carry a snapshot sequence number exactly one higher than the
/// generation they were cloned from.
#[derive(Debug, Clone)]
pub struct FileHeaderBlock {
    block_size: u32,
    archive_id: Uuid,
    archive_type: Uuid,
    minimum_read_version: i16,
    minimum_write_version: i16,
    header_block_count: u32,
    last_allocated_block: u32,
    snapshot_sequence_number: u32,
    next_file_id: u16,
    subfiles: Vec<SubFileHeader>,
    flags: Vec<Uuid>,
    user_attributes: BTreeMap<Uuid, Vec<u8>>,
    unknown_attributes: Vec<(u8, Vec<u8>)>,
    read_only: bool,
    simplified: bool,
}

impl FileHeaderBlock {
    /// Constructs the header of a brand-new, empty archive.
    ///
    /// Full mode reserves ten header replica blocks; simplified mode,
    /// used for in-memory and single-shot bulk-written archives,
    /// reserves one.
    ///
    /// # Errors
    ///
    /// Fails if the block size is not a power of two in the supported
    /// range, or too small to hold the serialized header.
    pub fn create_new(
        block_size: u32,
        simplified: bool,
        flags: Vec<Uuid>,
    ) -> Result<Self, FileError> {
        validate_block_size(block_size)?;

        let header_block_count = if simplified {
            SIMPLIFIED_HEADER_BLOCK_COUNT
        } else {
            FULL_HEADER_BLOCK_COUNT
        };
        let header = Self {
            block_size,
            archive_id: Uuid::new_v4(),
            archive_type: Uuid::nil(),
            minimum_read_version: HEADER_VERSION,
            minimum_write_version: HEADER_VERSION,
            header_block_count,
            last_allocated_block: header_block_count - 1,
            snapshot_sequence_number: 0,
            next_file_id: 0,
            subfiles: Vec::new(),
            flags,
            user_attributes: BTreeMap::new(),
            unknown_attributes: Vec::new(),
            read_only: true,
            simplified,
        };

        // Catch hopeless block sizes up front rather than at first save.
        let serialized = header.serialize();
        let payload = block_size as usize - crate::io::FOOTER_LEN;
        if serialized.len() > payload {
            return Err(FileError::BlockSizeTooSmall {
                block_size,
                required: serialized.len(),
            });
        }
        Ok(header)
    }

    /// Overrides the generated archive id; used when the file's name
    /// on disk is derived from the id before the file exists.
    pub(crate) fn with_archive_id(mut self, archive_id: Option<Uuid>) -> Self {
        if let Some(archive_id) = archive_id {
            self.archive_id = archive_id;
        }
        self
    }

    /// Produces the editable clone for a new edit session.
    ///
    /// The snapshot sequence number is bumped exactly once here;
    /// committing the clone publishes that new generation.
    pub fn clone_editable(&self) -> Self {
        let mut clone = self.clone();
        clone.read_only = false;
        clone.snapshot_sequence_number += 1;
        clone
    }

    pub(crate) fn finalize_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_simplified(&self) -> bool {
        self.simplified
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn archive_id(&self) -> Uuid {
        self.archive_id
    }

    pub fn archive_type(&self) -> Uuid {
        self.archive_type
    }

    pub fn set_archive_type(&mut self, archive_type: Uuid) -> Result<(), FileError> {
        self.check_writable()?;
        self.archive_type = archive_type;
        Ok(())
    }

    pub fn header_block_count(&self) -> u32 {
        self.header_block_count
    }

    pub fn last_allocated_block(&self) -> u32 {
        self.last_allocated_block
    }

    pub fn snapshot_sequence_number(&self) -> u32 {
        self.snapshot_sequence_number
    }

    pub fn file_count(&self) -> usize {
        self.subfiles.len()
    }

    pub fn subfile(&self, index: usize) -> Result<&SubFileHeader, FileError> {
        self.subfiles.get(index).ok_or(FileError::SubFileNotFound)
    }

    pub(crate) fn subfile_mut(&mut self, index: usize) -> Result<&mut SubFileHeader, FileError> {
        if self.read_only {
            return Err(FileError::ReadOnlyViolation);
        }
        self.subfiles
            .get_mut(index)
            .ok_or(FileError::SubFileNotFound)
    }

    pub fn index_of_name(&self, name: &SubFileName) -> Option<usize> {
        self.subfiles.iter().position(|f| f.name == *name)
    }

    /// Appends a new subfile to the directory.
    ///
    /// # Errors
    ///
    /// Fails with `DuplicateName` if a subfile with this name exists, or
    /// `FileCountOverflow` once the directory holds 64 entries.
    pub fn create_new_file(&mut self, name: SubFileName) -> Result<usize, FileError> {
        self.check_writable()?;
        if self.index_of_name(&name).is_some() {
            return Err(FileError::DuplicateName);
        }
        if self.subfiles.len() >= MAX_SUBFILES {
            return Err(FileError::FileCountOverflow {
                limit: MAX_SUBFILES,
            });
        }
        let file_id = self.next_file_id;
        self.next_file_id += 1;
        self.subfiles.push(SubFileHeader::new(file_id, name));
        Ok(self.subfiles.len() - 1)
    }

    /// Reserves `count` fresh block addresses, returning the first.
    ///
    /// Addresses are never reused within the lifetime of a file; the
    /// high-water mark only moves forward.
    pub fn allocate_free_blocks(&mut self, count: u32) -> Result<u32, FileError> {
        self.check_writable()?;
        let base = self
            .last_allocated_block
            .checked_add(1)
            .ok_or(FileError::OutOfBlockAddresses)?;
        // u32::MAX is the null sibling sentinel and must stay unallocated.
        let new_last = base
            .checked_add(count - 1)
            .filter(|&last| last < u32::MAX)
            .ok_or(FileError::OutOfBlockAddresses)?;
        self.last_allocated_block = new_last;
        Ok(base)
    }

    pub fn flags(&self) -> &[Uuid] {
        &self.flags
    }

    pub fn has_flag(&self, flag: Uuid) -> bool {
        self.flags.contains(&flag)
    }

    pub fn add_flag(&mut self, flag: Uuid) -> Result<(), FileError> {
        self.check_writable()?;
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        Ok(())
    }

    pub fn user_attribute(&self, key: Uuid) -> Option<&[u8]> {
        self.user_attributes.get(&key).map(Vec::as_slice)
    }

    pub fn set_user_attribute(&mut self, key: Uuid, value: Vec<u8>) -> Result<(), FileError> {
        self.check_writable()?;
        self.user_attributes.insert(key, value);
        Ok(())
    }

    fn check_writable(&self) -> Result<(), FileError> {
        if self.read_only {
            Err(FileError::ReadOnlyViolation)
        } else {
            Ok(())
        }
    }

    /// Serializes the header into a fresh byte vector.
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(MAGIC);
        buf.push(ENDIAN_MARKER);
        buf.push(self.block_size.trailing_zeros() as u8);
        buf.extend_from_slice(&self.minimum_read_version.to_le_bytes());
        buf.extend_from_slice(&self.minimum_write_version.to_le_bytes());

        buf.extend_from_slice(&self.archive_id.as_u128().to_le_bytes());
        buf.extend_from_slice(&self.archive_type.as_u128().to_le_bytes());
        buf.extend_from_slice(&self.header_block_count.to_le_bytes());
        buf.extend_from_slice(&self.last_allocated_block.to_le_bytes());
        buf.extend_from_slice(&self.snapshot_sequence_number.to_le_bytes());
        buf.extend_from_slice(&self.next_file_id.to_le_bytes());

        buf.extend_from_slice(&(self.subfiles.len() as u16).to_le_bytes());
        for subfile in &self.subfiles {
            let start = buf.len();
            buf.resize(start + SUBFILE_HEADER_LEN, 0);
            subfile.write_to(&mut buf[start..]);
        }

        if !self.flags.is_empty() {
            let mut payload = Vec::with_capacity(2 + self.flags.len() * 16);
            payload.extend_from_slice(&(self.flags.len() as u16).to_le_bytes());
            for flag in &self.flags {
                payload.extend_from_slice(&flag.as_u128().to_le_bytes());
            }
            push_attribute(&mut buf, TAG_FLAG_IDS, &payload);
        }

        if !self.user_attributes.is_empty() {
            let mut payload = Vec::new();
            payload.extend_from_slice(&(self.user_attributes.len() as u16).to_le_bytes());
            for (key, value) in &self.user_attributes {
                payload.extend_from_slice(&key.as_u128().to_le_bytes());
                push_7bit_u64(&mut payload, value.len() as u64);
                payload.extend_from_slice(value);
            }
            push_attribute(&mut buf, TAG_USER_ATTRIBUTES, &payload);
        }

        // Attributes we did not understand on load ride along untouched.
        for (tag, payload) in &self.unknown_attributes {
            push_attribute(&mut buf, *tag, payload);
        }

        buf.push(TAG_END_OF_ATTRIBUTES);
        buf
    }

    /// Serializes this header into a block payload region.
    ///
    /// # Errors
    ///
    /// Fails if the serialized header no longer fits the block payload;
    /// this can only happen when attributes grow after creation.
    pub fn save_to(&self, payload: &mut [u8]) -> Result<(), FileError> {
        let bytes = self.serialize();
        if bytes.len() > payload.len() {
            return Err(FileError::BlockSizeTooSmall {
                block_size: self.block_size,
                required: bytes.len(),
            });
        }
        payload[..bytes.len()].copy_from_slice(&bytes);
        payload[bytes.len()..].fill(0);
        Ok(())
    }

    /// Parses a header out of a block payload region.
    ///
    /// The resulting header is read-only; [`clone_editable`] produces
    /// the next generation.
    ///
    /// [`clone_editable`]: FileHeaderBlock::clone_editable
    ///
    /// # Errors
    ///
    /// Fails on bad magic, non-little-endian files, unsupported
    /// versions, out-of-range block sizes, or structurally invalid
    /// bodies.
    pub fn load_from(payload: &[u8]) -> Result<Self, FileError> {
        let mut reader = Reader::new(payload);

        let magic = reader.take(26)?;
        if magic != MAGIC {
            return Err(FileError::InvalidMagic);
        }
        if reader.u8()? != ENDIAN_MARKER {
            return Err(FileError::EndianMismatch);
        }
        let log2 = reader.u8()?;
        if !(MIN_BLOCK_SIZE_LOG2..=MAX_BLOCK_SIZE_LOG2).contains(&log2) {
            return Err(FileError::InvalidBlockSize { log2 });
        }
        let block_size = 1u32 << log2;

        let minimum_read_version = reader.i16()?;
        let minimum_write_version = reader.i16()?;
        if minimum_read_version > HEADER_VERSION {
            return Err(FileError::VersionNotRecognized {
                version: minimum_read_version,
                supported: HEADER_VERSION,
            });
        }

        let legacy = minimum_read_version < HEADER_VERSION;
        let (archive_id, archive_type) = if legacy {
            (Uuid::nil(), Uuid::nil())
        } else {
            (
                Uuid::from_u128(u128::from_le_bytes(reader.array16()?)),
                Uuid::from_u128(u128::from_le_bytes(reader.array16()?)),
            )
        };

        let header_block_count = reader.u32()?;
        let last_allocated_block = reader.u32()?;
        let snapshot_sequence_number = reader.u32()?;
        let next_file_id = reader.u16()?;

        let subfile_count = reader.u16()? as usize;
        if subfile_count > MAX_SUBFILES {
            return Err(FileError::CorruptHeader {
                reason: format!("subfile count {subfile_count} exceeds limit"),
            });
        }
        let mut subfiles = Vec::with_capacity(subfile_count);
        for _ in 0..subfile_count {
            subfiles.push(SubFileHeader::read_from(reader.take(SUBFILE_HEADER_LEN)?));
        }

        let mut flags = Vec::new();
        let mut user_attributes = BTreeMap::new();
        let mut unknown_attributes = Vec::new();
        if !legacy {
            loop {
                let tag = reader.u8()?;
                if tag == TAG_END_OF_ATTRIBUTES {
                    break;
                }
                let len = reader.varint()? as usize;
                let body = reader.take(len)?;
                match tag {
                    TAG_FLAG_IDS => {
                        let mut body_reader = Reader::new(body);
                        let count = body_reader.u16()? as usize;
                        for _ in 0..count {
                            flags.push(Uuid::from_u128(u128::from_le_bytes(
                                body_reader.array16()?,
                            )));
                        }
                    }
                    TAG_USER_ATTRIBUTES => {
                        let mut body_reader = Reader::new(body);
                        let count = body_reader.u16()? as usize;
                        for _ in 0..count {
                            let key =
                                Uuid::from_u128(u128::from_le_bytes(body_reader.array16()?));
                            let value_len = body_reader.varint()? as usize;
                            user_attributes.insert(key, body_reader.take(value_len)?.to_vec());
                        }
                    }
                    tag => unknown_attributes.push((tag, body.to_vec())),
                }
            }
        }

        // Sanity: every subfile root must sit inside the allocated range.
        for subfile in &subfiles {
            for address in [
                subfile.direct_block,
                subfile.single_indirect_block,
                subfile.double_indirect_block,
                subfile.triple_indirect_block,
                subfile.quadruple_indirect_block,
            ] {
                if address != 0 && address > last_allocated_block {
                    return Err(FileError::CorruptHeader {
                        reason: format!(
                            "subfile {} references block {address} beyond high-water mark {last_allocated_block}",
                            subfile.file_id
                        ),
                    });
                }
            }
        }

        Ok(Self {
            block_size,
            archive_id,
            archive_type,
            minimum_read_version,
            minimum_write_version,
            header_block_count,
            last_allocated_block,
            snapshot_sequence_number,
            next_file_id,
            subfiles,
            flags,
            user_attributes,
            unknown_attributes,
            read_only: true,
            simplified: header_block_count == SIMPLIFIED_HEADER_BLOCK_COUNT,
        })
    }
}

fn validate_block_size(block_size: u32) -> Result<(), FileError> {
    let log2 = block_size.trailing_zeros() as u8;
    if !block_size.is_power_of_two()
        || !(MIN_BLOCK_SIZE_LOG2..=MAX_BLOCK_SIZE_LOG2).contains(&log2)
    {
        return Err(FileError::InvalidBlockSize { log2 });
    }
    Ok(())
}

fn push_attribute(buf: &mut Vec<u8>, tag: u8, payload: &[u8]) {
    buf.push(tag);
    push_7bit_u64(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Bounds-checked cursor over the serialized header.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FileError> {
        let end = self.pos.checked_add(len).filter(|&end| end <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(FileError::CorruptHeader {
                reason: "header body truncated".to_string(),
            }),
        }
    }

    fn u8(&mut self) -> Result<u8, FileError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FileError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn i16(&mut self) -> Result<i16, FileError> {
        Ok(LittleEndian::read_i16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, FileError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn array16(&mut self) -> Result<[u8; 16], FileError> {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.take(16)?);
        Ok(out)
    }

    fn varint(&mut self) -> Result<u64, FileError> {
        read_7bit_u64(self.buf, &mut self.pos).ok_or_else(|| FileError::CorruptHeader {
            reason: "truncated varint in attribute stream".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(header: &FileHeaderBlock) -> FileHeaderBlock {
        let mut payload = vec![0u8; header.block_size() as usize - crate::io::FOOTER_LEN];
        header.save_to(&mut payload).unwrap();
        FileHeaderBlock::load_from(&payload).unwrap()
    }

    #[test]
    fn create_new_full_and_simplified_modes() {
        let full = FileHeaderBlock::create_new(4096, false, Vec::new()).unwrap();
        assert_eq!(full.header_block_count(), 10);
        assert_eq!(full.last_allocated_block(), 9);
        assert!(full.is_read_only());

        let simplified = FileHeaderBlock::create_new(4096, true, Vec::new()).unwrap();
        assert_eq!(simplified.header_block_count(), 1);
        assert_eq!(simplified.last_allocated_block(), 0);
    }

    #[test]
    fn block_size_bounds_are_enforced() {
        // The largest supported block size is accepted without backing
        // storage being touched.
        let huge = FileHeaderBlock::create_new(1 << 30, false, Vec::new()).unwrap();
        assert_eq!(huge.block_size(), 1 << 30);

        assert!(matches!(
            FileHeaderBlock::create_new(1 << 31, false, Vec::new()),
            Err(FileError::InvalidBlockSize { log2: 31 })
        ));
        assert!(matches!(
            FileHeaderBlock::create_new(3000, false, Vec::new()),
            Err(FileError::InvalidBlockSize { .. })
        ));
        // 32-byte blocks are valid at the I/O layer but cannot hold a
        // serialized header.
        assert!(matches!(
            FileHeaderBlock::create_new(32, false, Vec::new()),
            Err(FileError::BlockSizeTooSmall { .. })
        ));
    }

    #[test]
    fn editable_clone_bumps_sequence_exactly_once() {
        let header = FileHeaderBlock::create_new(4096, false, Vec::new()).unwrap();
        let edit = header.clone_editable();
        assert_eq!(
            edit.snapshot_sequence_number(),
            header.snapshot_sequence_number() + 1
        );
        assert!(!edit.is_read_only());
    }

    #[test]
    fn read_only_header_rejects_mutation() {
        let mut header = FileHeaderBlock::create_new(4096, false, Vec::new()).unwrap();
        assert!(matches!(
            header.allocate_free_blocks(1),
            Err(FileError::ReadOnlyViolation)
        ));
        assert!(matches!(
            header.create_new_file(SubFileName::from_uuid_triple(
                Uuid::from_u128(1),
                Uuid::from_u128(2),
                Uuid::from_u128(3),
            )),
            Err(FileError::ReadOnlyViolation)
        ));
    }

    #[test]
    fn subfile_creation_enforces_uniqueness_and_limit() {
        let mut header = FileHeaderBlock::create_new(65536, false, Vec::new())
            .unwrap()
            .clone_editable();
        let name = SubFileName::from_table("points", Uuid::from_u128(1), Uuid::from_u128(2));
        header.create_new_file(name).unwrap();
        assert!(matches!(
            header.create_new_file(name),
            Err(FileError::DuplicateName)
        ));

        for n in 1..MAX_SUBFILES {
            let unique =
                SubFileName::from_table("points", Uuid::from_u128(n as u128 + 10), Uuid::nil());
            header.create_new_file(unique).unwrap();
        }
        assert!(matches!(
            header.create_new_file(SubFileName::from_table(
                "one-too-many",
                Uuid::nil(),
                Uuid::nil()
            )),
            Err(FileError::FileCountOverflow { .. })
        ));
    }

    #[test]
    fn allocation_moves_high_water_mark_forward_only() {
        let mut header = FileHeaderBlock::create_new(4096, false, Vec::new())
            .unwrap()
            .clone_editable();
        assert_eq!(header.allocate_free_blocks(3).unwrap(), 10);
        assert_eq!(header.allocate_free_blocks(1).unwrap(), 13);
        assert_eq!(header.last_allocated_block(), 13);
    }

    #[test]
    fn save_load_round_trip_is_observationally_equal() {
        let mut header = FileHeaderBlock::create_new(
            4096,
            false,
            vec![Uuid::from_u128(0xaa), Uuid::from_u128(0xbb)],
        )
        .unwrap()
        .clone_editable();
        let name = SubFileName::from_table("points", Uuid::from_u128(5), Uuid::from_u128(6));
        let index = header.create_new_file(name).unwrap();
        header.allocate_free_blocks(7).unwrap();
        header.subfile_mut(index).unwrap().direct_block = 12;
        header
            .set_user_attribute(Uuid::from_u128(0xcc), vec![1, 2, 3])
            .unwrap();

        let loaded = round_trip(&header);
        assert_eq!(loaded.block_size(), header.block_size());
        assert_eq!(loaded.archive_id(), header.archive_id());
        assert_eq!(
            loaded.snapshot_sequence_number(),
            header.snapshot_sequence_number()
        );
        assert_eq!(loaded.last_allocated_block(), header.last_allocated_block());
        assert_eq!(loaded.file_count(), 1);
        assert_eq!(loaded.subfile(0).unwrap(), header.subfile(0).unwrap());
        assert_eq!(loaded.flags(), header.flags());
        assert_eq!(
            loaded.user_attribute(Uuid::from_u128(0xcc)),
            Some(&[1u8, 2, 3][..])
        );
        assert!(loaded.is_read_only());
    }

    #[test]
    fn unknown_attributes_survive_round_trips() {
        let mut header = FileHeaderBlock::create_new(4096, false, Vec::new())
            .unwrap()
            .clone_editable();
        header.unknown_attributes.push((99, vec![9, 8, 7]));

        let loaded = round_trip(&header);
        assert_eq!(loaded.unknown_attributes, vec![(99u8, vec![9u8, 8, 7])]);

        // And they are re-emitted verbatim on the next save as well.
        let again = round_trip(&loaded);
        assert_eq!(again.unknown_attributes, loaded.unknown_attributes);
    }

    #[test]
    fn bad_magic_endian_and_version_are_rejected() {
        let header = FileHeaderBlock::create_new(4096, false, Vec::new()).unwrap();
        let mut payload = vec![0u8; 4096 - crate::io::FOOTER_LEN];
        header.save_to(&mut payload).unwrap();

        let mut bad_magic = payload.clone();
        bad_magic[0] = b'x';
        assert!(matches!(
            FileHeaderBlock::load_from(&bad_magic),
            Err(FileError::InvalidMagic)
        ));

        let mut big_endian = payload.clone();
        big_endian[26] = b'B';
        assert!(matches!(
            FileHeaderBlock::load_from(&big_endian),
            Err(FileError::EndianMismatch)
        ));

        let mut future = payload.clone();
        future[28] = 99;
        assert!(matches!(
            FileHeaderBlock::load_from(&future),
            Err(FileError::VersionNotRecognized { version: 99, .. })
        ));
    }
}

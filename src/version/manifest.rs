//! MANIFEST - append-only log of version edits.
//!
//! The manifest persists every change to the catalog's file structure;
//! replaying it reconstructs the current version on startup. Records are
//! framed in the same CRC-checked 32KB block format the write-ahead log
//! uses, so a record may span blocks as First/Middle/Last fragments.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::util::crc::{crc32_multi, mask_crc, unmask_crc};
use crate::version::VersionEdit;
use crate::{Error, Result};

/// Block size (32KB, shared with the WAL).
const BLOCK_SIZE: usize = 32 * 1024;

/// Header size: CRC (4) + Length (2) + Type (1) = 7 bytes.
const HEADER_SIZE: usize = 7;

/// Physical record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    /// Zero is reserved for pre-allocated files.
    Zero = 0,
    /// Complete record in a single fragment.
    Full = 1,
    /// First fragment of a record.
    First = 2,
    /// Middle fragment(s) of a record.
    Middle = 3,
    /// Last fragment of a record.
    Last = 4,
}

impl RecordType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }

    fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Appends version edits to a manifest file.
pub struct ManifestWriter {
    writer: BufWriter<File>,
    /// Current position within the current block.
    block_offset: usize,
    path: PathBuf,
}

impl ManifestWriter {
    /// Create a fresh manifest, truncating any previous file.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset: 0,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing manifest for appending.
    pub fn open_for_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let file_size = file.metadata()?.len() as usize;

        Ok(Self {
            writer: BufWriter::with_capacity(BLOCK_SIZE * 4, file),
            block_offset: file_size % BLOCK_SIZE,
            path: path.to_path_buf(),
        })
    }

    /// The manifest file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an encoded version edit as one logical record.
    pub fn add_edit(&mut self, edit: &VersionEdit) -> Result<()> {
        self.add_record(&edit.encode())
    }

    /// Append a raw record, fragmenting across blocks as needed.
    fn add_record(&mut self, data: &[u8]) -> Result<()> {
        let mut left = data.len();
        let mut ptr = 0;
        let mut begin = true;

        loop {
            let leftover = BLOCK_SIZE - self.block_offset;

            // Switch to a new block if a header no longer fits.
            if leftover < HEADER_SIZE {
                if leftover > 0 {
                    self.writer.write_all(&vec![0u8; leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = std::cmp::min(left, avail);
            let end = left == fragment_length;

            let record_type = if begin && end {
                RecordType::Full
            } else if begin {
                RecordType::First
            } else if end {
                RecordType::Last
            } else {
                RecordType::Middle
            };

            self.emit_physical_record(record_type, &data[ptr..ptr + fragment_length])?;

            ptr += fragment_length;
            left -= fragment_length;
            begin = false;

            if left == 0 {
                break;
            }
        }

        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xFFFF);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        // CRCs are masked before storage so a record whose payload
        // embeds other CRCs still checks independently.
        let crc = mask_crc(crc32_multi(&[&[record_type.to_byte()], data]));

        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&crc.to_le_bytes());
        header[4..6].copy_from_slice(&(data.len() as u16).to_le_bytes());
        header[6] = record_type.to_byte();

        self.writer.write_all(&header)?;
        self.writer.write_all(data)?;

        self.block_offset += HEADER_SIZE + data.len();

        Ok(())
    }

    /// Flush buffers and fsync file contents.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Flush buffered data without syncing to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flush, sync, and close the writer.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }
}

/// Reads version edits back out of a manifest file.
pub struct ManifestReader {
    reader: BufReader<File>,
    buffer: Vec<u8>,
    buffer_offset: usize,
    buffer_size: usize,
    eof: bool,
    /// Whether framing damage is surfaced as an error or skipped.
    strict: bool,
}

impl ManifestReader {
    /// Open a manifest for replay.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;

        Ok(Self {
            reader: BufReader::with_capacity(BLOCK_SIZE * 4, file),
            buffer: vec![0u8; BLOCK_SIZE],
            buffer_offset: 0,
            buffer_size: 0,
            eof: false,
            strict: true,
        })
    }

    /// Skip damaged records instead of failing on them.
    pub fn set_strict(&mut self, strict: bool) {
        self.strict = strict;
    }

    /// Read the next edit, or `None` at end of log.
    pub fn read_edit(&mut self) -> Result<Option<VersionEdit>> {
        match self.read_record()? {
            Some(data) => Ok(Some(VersionEdit::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Read and collect every remaining edit.
    pub fn read_all_edits(&mut self) -> Result<Vec<VersionEdit>> {
        let mut edits = Vec::new();
        while let Some(edit) = self.read_edit()? {
            edits.push(edit);
        }
        Ok(edits)
    }

    fn read_record(&mut self) -> Result<Option<Vec<u8>>> {
        let mut scratch = Vec::new();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record()? {
                Some((record_type, data)) => match record_type {
                    RecordType::Full => {
                        if in_fragmented_record {
                            scratch.clear();
                        }
                        return Ok(Some(data));
                    }
                    RecordType::First => {
                        if in_fragmented_record {
                            scratch.clear();
                        }
                        scratch.extend_from_slice(&data);
                        in_fragmented_record = true;
                    }
                    RecordType::Middle => {
                        if !in_fragmented_record {
                            if self.strict {
                                return Err(Error::corruption(
                                    "unexpected middle record fragment",
                                ));
                            }
                            continue;
                        }
                        scratch.extend_from_slice(&data);
                    }
                    RecordType::Last => {
                        if !in_fragmented_record {
                            if self.strict {
                                return Err(Error::corruption("unexpected last record fragment"));
                            }
                            continue;
                        }
                        scratch.extend_from_slice(&data);
                        return Ok(Some(scratch));
                    }
                    RecordType::Zero => continue,
                },
                None => {
                    if in_fragmented_record {
                        scratch.clear();
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn read_physical_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        loop {
            if self.buffer_offset + HEADER_SIZE > self.buffer_size {
                if !self.read_block()? {
                    return Ok(None);
                }
                continue;
            }

            let header = &self.buffer[self.buffer_offset..self.buffer_offset + HEADER_SIZE];

            let crc_expected = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type_byte = header[6];

            let record_type = match RecordType::from_byte(record_type_byte) {
                Some(rt) => rt,
                None => {
                    if self.strict {
                        return Err(Error::corruption("invalid record type"));
                    }
                    self.buffer_offset = self.buffer_size;
                    continue;
                }
            };

            // A zero-length Zero record is block padding.
            if record_type == RecordType::Zero && length == 0 && crc_expected == 0 {
                self.buffer_offset = self.buffer_size;
                continue;
            }

            if self.buffer_offset + HEADER_SIZE + length > self.buffer_size {
                if self.eof {
                    // Truncated tail from a crash mid-append; the record
                    // was never acknowledged.
                    return Ok(None);
                }
                if self.strict {
                    return Err(Error::corruption("record extends beyond block"));
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let data_start = self.buffer_offset + HEADER_SIZE;
            let data = &self.buffer[data_start..data_start + length];

            let crc_actual = crc32_multi(&[&[record_type_byte], data]);
            if unmask_crc(crc_expected) != crc_actual {
                if self.strict {
                    return Err(Error::corruption("record checksum mismatch"));
                }
                self.buffer_offset = self.buffer_size;
                continue;
            }

            let data = data.to_vec();
            self.buffer_offset = data_start + length;

            return Ok(Some((record_type, data)));
        }
    }

    fn read_block(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }

        self.buffer_offset = 0;
        let bytes_read = self.reader.read(&mut self.buffer)?;

        if bytes_read == 0 {
            self.eof = true;
            self.buffer_size = 0;
            return Ok(false);
        }

        self.buffer_size = bytes_read;

        if bytes_read < BLOCK_SIZE {
            self.eof = true;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InternalKey, ValueType};
    use crate::version::FileMetadata;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn make_key(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(Bytes::copy_from_slice(user_key), seq, ValueType::Value)
    }

    #[test]
    fn test_manifest_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");

        ManifestWriter::create(&path).unwrap().close().unwrap();

        let mut reader = ManifestReader::open(&path).unwrap();
        assert!(reader.read_edit().unwrap().is_none());
    }

    #[test]
    fn test_manifest_single_edit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");

        let mut writer = ManifestWriter::create(&path).unwrap();
        let mut edit = VersionEdit::new();
        edit.set_comparator("leveldb.BytewiseComparator");
        edit.set_log_number(10);
        edit.set_next_file_number(100);
        writer.add_edit(&edit).unwrap();
        writer.close().unwrap();

        let mut reader = ManifestReader::open(&path).unwrap();
        let recovered = reader.read_edit().unwrap().unwrap();

        assert_eq!(recovered.comparator.as_deref(), Some("leveldb.BytewiseComparator"));
        assert_eq!(recovered.log_number, Some(10));
        assert_eq!(recovered.next_file_number, Some(100));
        assert!(reader.read_edit().unwrap().is_none());
    }

    #[test]
    fn test_manifest_many_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");

        let mut writer = ManifestWriter::create(&path).unwrap();
        for i in 0..10u64 {
            let mut edit = VersionEdit::new();
            edit.set_last_sequence(i * 100);
            edit.add_file(
                (i % 4) as usize,
                FileMetadata::new(i, 1024 * (i + 1), make_key(b"start", i + 1), make_key(b"zz", i + 100)),
            );
            writer.add_edit(&edit).unwrap();
        }
        writer.close().unwrap();

        let mut reader = ManifestReader::open(&path).unwrap();
        let edits = reader.read_all_edits().unwrap();

        assert_eq!(edits.len(), 10);
        for (i, edit) in edits.iter().enumerate() {
            assert_eq!(edit.last_sequence, Some((i as u64) * 100));
            assert_eq!(edit.new_files.len(), 1);
            assert_eq!(edit.new_files[0].0, i % 4);
        }
    }

    #[test]
    fn test_manifest_record_spanning_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");

        // One edit bigger than a block forces First/Middle/Last framing.
        let mut edit = VersionEdit::new();
        let big_key = vec![b'k'; 40 * 1024];
        edit.set_compact_pointer(1, make_key(&big_key, 1));

        let mut writer = ManifestWriter::create(&path).unwrap();
        writer.add_edit(&edit).unwrap();
        writer.close().unwrap();

        let mut reader = ManifestReader::open(&path).unwrap();
        let recovered = reader.read_edit().unwrap().unwrap();
        assert_eq!(
            recovered.compact_pointers.get(&1).map(|k| k.user_key().len()),
            Some(big_key.len())
        );
    }

    #[test]
    fn test_manifest_append_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");

        {
            let mut writer = ManifestWriter::create(&path).unwrap();
            let mut edit = VersionEdit::new();
            edit.set_log_number(1);
            writer.add_edit(&edit).unwrap();
            writer.close().unwrap();
        }
        {
            let mut writer = ManifestWriter::open_for_append(&path).unwrap();
            let mut edit = VersionEdit::new();
            edit.set_log_number(2);
            writer.add_edit(&edit).unwrap();
            writer.close().unwrap();
        }

        let mut reader = ManifestReader::open(&path).unwrap();
        let edits = reader.read_all_edits().unwrap();
        assert_eq!(edits.len(), 2);
        assert_eq!(edits[0].log_number, Some(1));
        assert_eq!(edits[1].log_number, Some(2));
    }

    #[test]
    fn test_manifest_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("MANIFEST-000001");

        let mut writer = ManifestWriter::create(&path).unwrap();
        let mut edit = VersionEdit::new();
        edit.set_log_number(1);
        edit.set_next_file_number(5);
        writer.add_edit(&edit).unwrap();
        writer.close().unwrap();

        // Flip a payload byte.
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let mut reader = ManifestReader::open(&path).unwrap();
        assert!(reader.read_edit().is_err());

        // Non-strict mode skips the damage.
        let mut reader = ManifestReader::open(&path).unwrap();
        reader.set_strict(false);
        assert!(reader.read_edit().unwrap().is_none());
    }
}

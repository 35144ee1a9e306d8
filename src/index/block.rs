//! Compressed block I/O for `.cidx` files.
//!
//! File layout:
//!
//! ```text
//! "CIDX"                          4 bytes
//! [LZ4-compressed record block]*
//! JSON directory {"blocks":[...]}
//! directory length                big-endian i64
//! ```
//!
//! Records are buffered until their raw size reaches the 64 KiB target,
//! then each block is compressed independently with an LZ4 frame so a
//! reader can decompress any block without touching its neighbors.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lz4_flex::frame::{BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use serde::{Deserialize, Serialize};

use crate::storage::record::{self, IndexRecord, KEY_SIZE};
use crate::{CidxError, Result};

/// Magic bytes at the start of every index file
pub const MAGIC_CIDX: &[u8; 4] = b"CIDX";

/// Raw (uncompressed) byte size at which a block is flushed
pub const BLOCK_TARGET_SIZE: usize = 64 * 1024;

/// Directory entry describing one compressed block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Trimmed key of the first record in the block.
    pub start_key: String,
    /// Byte offset of the compressed block within the file.
    pub offset: i64,
    /// Compressed byte length.
    pub length: i64,
    /// Number of records in the block.
    pub record_count: i64,
    /// True when every record in the block shares the same key.
    pub is_distinct: bool,
}

/// Sparse directory appended to the end of the index file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SparseFooter {
    pub blocks: Vec<BlockMeta>,
}

fn frame_info() -> FrameInfo {
    FrameInfo::new().block_size(BlockSize::Max64KB)
}

// ============================================================================
// Writer
// ============================================================================

/// Streaming writer that buffers sorted records into compressed blocks and
/// finishes with the sparse directory footer.
pub struct BlockWriter<W: Write> {
    w: W,
    buffer: Vec<IndexRecord>,
    current_size: usize,
    footer: SparseFooter,
    offset: i64,
    raw_buf: Vec<u8>,
    comp_buf: Vec<u8>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(mut w: W) -> Result<Self> {
        w.write_all(MAGIC_CIDX)?;
        Ok(Self {
            w,
            buffer: Vec::with_capacity(1000),
            current_size: 0,
            footer: SparseFooter::default(),
            offset: MAGIC_CIDX.len() as i64,
            raw_buf: Vec::new(),
            comp_buf: Vec::new(),
        })
    }

    /// Append a record; flushes a block once the raw size hits the target.
    pub fn write_record(&mut self, rec: IndexRecord) -> Result<()> {
        self.buffer.push(rec);
        self.current_size += KEY_SIZE + 16;
        if self.current_size >= BLOCK_TARGET_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        self.comp_buf.clear();
        let mut enc = FrameEncoder::with_frame_info(frame_info(), &mut self.comp_buf);
        record::write_batch(&mut enc, &self.buffer, &mut self.raw_buf)?;
        enc.finish().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let first = &self.buffer[0];
        let start_key = String::from_utf8_lossy(first.trimmed_key()).into_owned();
        let is_distinct = self.buffer.iter().all(|r| r.key == first.key);

        self.footer.blocks.push(BlockMeta {
            start_key,
            offset: self.offset,
            length: self.comp_buf.len() as i64,
            record_count: self.buffer.len() as i64,
            is_distinct,
        });

        self.w.write_all(&self.comp_buf)?;
        self.offset += self.comp_buf.len() as i64;
        self.buffer.clear();
        self.current_size = 0;
        Ok(())
    }

    /// Flush the tail block and append the directory plus its length.
    pub fn close(mut self) -> Result<SparseFooter> {
        self.flush_block()?;

        let footer_bytes = serde_json::to_vec(&self.footer)
            .map_err(|e| CidxError::IndexCorrupt(format!("directory encode: {e}")))?;
        self.w.write_all(&footer_bytes)?;
        self.w.write_i64::<BigEndian>(footer_bytes.len() as i64)?;
        self.w.flush()?;
        Ok(self.footer)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Reader over an existing `.cidx` file: parses the footer on open and
/// decompresses blocks on demand into reusable buffers.
pub struct BlockReader<R: Read + Seek> {
    r: R,
    footer: SparseFooter,
    file_len: u64,
    comp_buf: Vec<u8>,
    raw_scratch: Vec<u8>,
    rec_buf: Vec<IndexRecord>,
}

impl<R: Read + Seek> BlockReader<R> {
    pub fn open(mut r: R) -> Result<Self> {
        let file_len = r.seek(SeekFrom::End(0))?;
        if file_len < (MAGIC_CIDX.len() + 8) as u64 {
            return Err(CidxError::IndexCorrupt("file too short".into()));
        }

        r.seek(SeekFrom::End(-8))?;
        let footer_len = r.read_i64::<BigEndian>()?;
        if footer_len < 0 || footer_len as u64 + 8 > file_len {
            return Err(CidxError::IndexCorrupt(format!(
                "directory length {footer_len} out of range"
            )));
        }

        r.seek(SeekFrom::End(-(8 + footer_len)))?;
        let mut footer_bytes = vec![0u8; footer_len as usize];
        r.read_exact(&mut footer_bytes)?;

        let footer: SparseFooter = serde_json::from_slice(&footer_bytes)
            .map_err(|e| CidxError::IndexCorrupt(format!("directory parse: {e}")))?;

        Ok(Self {
            r,
            footer,
            file_len,
            comp_buf: Vec::new(),
            raw_scratch: Vec::new(),
            rec_buf: Vec::new(),
        })
    }

    pub fn footer(&self) -> &SparseFooter {
        &self.footer
    }

    /// Decompress one block and decode its records in index order.
    ///
    /// The returned slice borrows an internal buffer that the next call
    /// overwrites.
    pub fn read_block(&mut self, meta: &BlockMeta) -> Result<&[IndexRecord]> {
        if meta.offset < 0
            || meta.length < 0
            || meta.record_count < 0
            || (meta.offset + meta.length) as u64 > self.file_len
        {
            return Err(CidxError::IndexCorrupt(format!(
                "block at {} len {} beyond EOF",
                meta.offset, meta.length
            )));
        }

        self.r.seek(SeekFrom::Start(meta.offset as u64))?;
        self.comp_buf.clear();
        self.comp_buf.resize(meta.length as usize, 0);
        self.r.read_exact(&mut self.comp_buf)?;

        let mut dec = FrameDecoder::new(&self.comp_buf[..]);
        record::read_batch(
            &mut dec,
            meta.record_count as usize,
            &mut self.raw_scratch,
            &mut self.rec_buf,
        )
        .map_err(|e| CidxError::IndexCorrupt(format!("block decompress: {e}")))?;

        Ok(&self.rec_buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::RECORD_SIZE;
    use std::io::Cursor;

    fn rec(key: &str, offset: i64, line: i64) -> IndexRecord {
        IndexRecord::new(key.as_bytes(), offset, line)
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut buf = Cursor::new(Vec::new());
        let mut w = BlockWriter::new(&mut buf).unwrap();
        let recs = vec![rec("alpha", 10, 2), rec("alpha", 20, 3), rec("beta", 30, 4)];
        for r in &recs {
            w.write_record(*r).unwrap();
        }
        let footer = w.close().unwrap();
        assert_eq!(footer.blocks.len(), 1);
        assert_eq!(footer.blocks[0].start_key, "alpha");
        assert_eq!(footer.blocks[0].record_count, 3);
        assert!(!footer.blocks[0].is_distinct);

        buf.set_position(0);
        let mut reader = BlockReader::open(buf).unwrap();
        assert_eq!(reader.footer().blocks.len(), 1);
        let meta = reader.footer().blocks[0].clone();
        let out = reader.read_block(&meta).unwrap();
        assert_eq!(out, recs.as_slice());
    }

    #[test]
    fn test_multiple_blocks_and_distinct_flag() {
        let mut buf = Cursor::new(Vec::new());
        let mut w = BlockWriter::new(&mut buf).unwrap();
        // 80 raw bytes per record, 64 KiB target → 820 records per block
        for i in 0..2000 {
            let key = if i < 900 { "aaaa".to_string() } else { format!("k{i:05}") };
            w.write_record(rec(&key, i, i + 2)).unwrap();
        }
        let footer = w.close().unwrap();
        assert!(footer.blocks.len() > 1);
        assert_eq!(footer.blocks.iter().map(|b| b.record_count).sum::<i64>(), 2000);
        // the first block holds only the repeated key
        assert!(footer.blocks[0].is_distinct);
        assert_eq!(footer.blocks[0].start_key, "aaaa");
        assert!(!footer.blocks[1].is_distinct);

        // directory offsets must be increasing and non-overlapping
        for pair in footer.blocks.windows(2) {
            assert!(pair[0].offset + pair[0].length <= pair[1].offset);
            assert!(pair[0].start_key <= pair[1].start_key);
        }

        buf.set_position(0);
        let mut reader = BlockReader::open(buf).unwrap();
        let metas = reader.footer().blocks.clone();
        let mut total = 0;
        for meta in &metas {
            total += reader.read_block(meta).unwrap().len();
        }
        assert_eq!(total, 2000);
    }

    #[test]
    fn test_magic_written_first() {
        let mut buf = Cursor::new(Vec::new());
        let w = BlockWriter::new(&mut buf).unwrap();
        w.close().unwrap();
        assert_eq!(&buf.get_ref()[..4], MAGIC_CIDX);
    }

    #[test]
    fn test_corrupt_footer_rejected() {
        let data = b"CIDXgarbage\x00\x00\x00\x00\x00\x00\x00\x07";
        assert!(matches!(
            BlockReader::open(Cursor::new(data.to_vec())),
            Err(CidxError::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_block_beyond_eof_rejected() {
        let mut buf = Cursor::new(Vec::new());
        let mut w = BlockWriter::new(&mut buf).unwrap();
        w.write_record(rec("a", 0, 2)).unwrap();
        w.close().unwrap();

        buf.set_position(0);
        let mut reader = BlockReader::open(buf).unwrap();
        let mut meta = reader.footer().blocks[0].clone();
        meta.length = 1 << 30;
        assert!(matches!(reader.read_block(&meta), Err(CidxError::IndexCorrupt(_))));
    }

    #[test]
    fn test_raw_size_accounting() {
        // RECORD_SIZE must equal what the writer counts per record
        assert_eq!(RECORD_SIZE, KEY_SIZE + 16);
    }
}

//! Fixed 80-byte index record and its binary codec.
//!
//! Layout: key (64 bytes, zero-padded right) + offset (big-endian i64) +
//! line (big-endian i64). Batch read/write reuse a single heap buffer so
//! the sorter and block I/O paths stay allocation-free per record.

use std::io::{self, Read, Write};

/// Size of the key in an index record
pub const KEY_SIZE: usize = 64;

/// Size of an index record: key(64) + offset(8) + line(8)
pub const RECORD_SIZE: usize = KEY_SIZE + 8 + 8;

/// A single entry in an index file: a keyed row position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Key bytes, zero-padded on the right. Keys longer than 64 bytes are
    /// truncated at build time.
    pub key: [u8; KEY_SIZE],
    /// Byte offset of the row's first byte in the CSV.
    pub offset: i64,
    /// 1-based physical line number of the row (header is line 1).
    pub line: i64,
}

impl IndexRecord {
    /// Build a record, truncating the key to 64 bytes.
    pub fn new(key: &[u8], offset: i64, line: i64) -> Self {
        let mut k = [0u8; KEY_SIZE];
        let n = key.len().min(KEY_SIZE);
        k[..n].copy_from_slice(&key[..n]);
        Self { key: k, offset, line }
    }

    /// Key bytes with the zero padding trimmed.
    #[inline]
    pub fn trimmed_key(&self) -> &[u8] {
        let mut len = KEY_SIZE;
        while len > 0 && self.key[len - 1] == 0 {
            len -= 1;
        }
        &self.key[..len]
    }

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..KEY_SIZE].copy_from_slice(&self.key);
        buf[KEY_SIZE..KEY_SIZE + 8].copy_from_slice(&self.offset.to_be_bytes());
        buf[KEY_SIZE + 8..RECORD_SIZE].copy_from_slice(&self.line.to_be_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        Self {
            key: buf[..KEY_SIZE].try_into().unwrap(),
            offset: i64::from_be_bytes(buf[KEY_SIZE..KEY_SIZE + 8].try_into().unwrap()),
            line: i64::from_be_bytes(buf[KEY_SIZE + 8..RECORD_SIZE].try_into().unwrap()),
        }
    }
}

/// Read a single record from a stream.
///
/// Returns `Ok(None)` on a clean EOF at a record boundary.
pub fn read_record(r: &mut impl Read) -> io::Result<Option<IndexRecord>> {
    let mut buf = [0u8; RECORD_SIZE];
    let mut filled = 0;
    while filled < RECORD_SIZE {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated index record",
            ));
        }
        filled += n;
    }
    Ok(Some(IndexRecord::decode_from(&buf)))
}

/// Write a single record to a stream.
pub fn write_record(w: &mut impl Write, rec: &IndexRecord) -> io::Result<()> {
    let mut buf = [0u8; RECORD_SIZE];
    rec.encode_into(&mut buf);
    w.write_all(&buf)
}

/// Write a batch of records through one reused buffer and a single write.
pub fn write_batch(w: &mut impl Write, recs: &[IndexRecord], scratch: &mut Vec<u8>) -> io::Result<()> {
    if recs.is_empty() {
        return Ok(());
    }
    scratch.clear();
    scratch.resize(recs.len() * RECORD_SIZE, 0);
    for (i, rec) in recs.iter().enumerate() {
        rec.encode_into(&mut scratch[i * RECORD_SIZE..(i + 1) * RECORD_SIZE]);
    }
    w.write_all(scratch)
}

/// Read `count` records through one reused buffer.
pub fn read_batch(
    r: &mut impl Read,
    count: usize,
    scratch: &mut Vec<u8>,
    out: &mut Vec<IndexRecord>,
) -> io::Result<()> {
    scratch.clear();
    scratch.resize(count * RECORD_SIZE, 0);
    r.read_exact(scratch)?;
    out.clear();
    out.reserve(count);
    for i in 0..count {
        out.push(IndexRecord::decode_from(&scratch[i * RECORD_SIZE..(i + 1) * RECORD_SIZE]));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let rec = IndexRecord::new(b"hello", 1234, 56);
        let mut buf = Vec::new();
        write_record(&mut buf, &rec).unwrap();
        assert_eq!(buf.len(), RECORD_SIZE);

        let back = read_record(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.trimmed_key(), b"hello");
    }

    #[test]
    fn test_key_truncation() {
        let long = vec![b'x'; 100];
        let rec = IndexRecord::new(&long, 0, 2);
        assert_eq!(rec.trimmed_key().len(), KEY_SIZE);
    }

    #[test]
    fn test_batch_round_trip() {
        let recs: Vec<IndexRecord> = (0..10)
            .map(|i| IndexRecord::new(format!("key{i}").as_bytes(), i * 80, i + 2))
            .collect();

        let mut buf = Vec::new();
        let mut scratch = Vec::new();
        write_batch(&mut buf, &recs, &mut scratch).unwrap();
        assert_eq!(buf.len(), 10 * RECORD_SIZE);

        let mut out = Vec::new();
        read_batch(&mut buf.as_slice(), 10, &mut scratch, &mut out).unwrap();
        assert_eq!(out, recs);
    }

    #[test]
    fn test_read_record_eof() {
        let empty: &[u8] = &[];
        assert!(read_record(&mut &*empty).unwrap().is_none());

        let short = [0u8; 10];
        assert!(read_record(&mut &short[..]).is_err());
    }
}

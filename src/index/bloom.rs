//! Bloom filter sidecar for index lookups.
//!
//! Sized from a capacity and target false-positive rate, hashed with two
//! CRC32 passes (the second over the reversed key plus a salt) combined as
//! `h1 + i*h2`. Serialized as a 24-byte big-endian header
//! `(size_bits, hash_count, element_count)` followed by the raw bit array.
//!
//! The on-disk form can be loaded either into an owned buffer or directly
//! over a memory mapping; the mapping stays alive for as long as the
//! filter value does.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

use crate::{CidxError, Result};

const HEADER_SIZE: usize = 24;
const HASH_SALT: &[u8] = b"salt";
const MIN_BITS: usize = 1024;
const MAX_HASHES: u32 = 10;

enum Bits {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Bits {
    #[inline]
    fn bytes(&self) -> &[u8] {
        match self {
            Bits::Owned(v) => v,
            Bits::Mapped(m) => &m[HEADER_SIZE..],
        }
    }
}

/// Fixed-size bloom filter with CRC32 double hashing.
pub struct BloomFilter {
    bits: Bits,
    size_bits: usize,
    hash_count: u32,
    element_count: u64,
}

impl BloomFilter {
    /// Size a filter for `capacity` elements at false-positive rate `p`.
    pub fn new(capacity: usize, p: f64) -> Self {
        let n = capacity.max(1);
        let p = if p > 0.0 && p < 1.0 { p } else { 0.01 };

        let mut m = (-(n as f64) * p.ln() / 0.4804).ceil() as usize;
        if m < MIN_BITS {
            m = MIN_BITS;
        }
        m = (m + 7) / 8 * 8;

        let k = ((m as f64 / n as f64) * 0.693).round() as u32;
        let k = k.clamp(1, MAX_HASHES);

        Self {
            bits: Bits::Owned(vec![0u8; m / 8]),
            size_bits: m,
            hash_count: k,
            element_count: 0,
        }
    }

    fn hashes(key: &[u8]) -> (u32, u32) {
        let h1 = crc32fast::hash(key);
        let mut reversed = Vec::with_capacity(key.len() + HASH_SALT.len());
        reversed.extend(key.iter().rev());
        reversed.extend_from_slice(HASH_SALT);
        let h2 = crc32fast::hash(&reversed);
        (h1, h2)
    }

    /// Insert a key. Panics if the filter is backed by a read-only mapping.
    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hashes(key);
        let m = self.size_bits as u64;
        let bits = match &mut self.bits {
            Bits::Owned(v) => v,
            Bits::Mapped(_) => panic!("insert into mmap-backed bloom filter"),
        };
        for i in 0..self.hash_count as u64 {
            let pos = (h1 as u64 + i * h2 as u64) % m;
            bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
        self.element_count += 1;
    }

    /// False means definitely absent; true means possibly present.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hashes(key);
        let m = self.size_bits as u64;
        let bits = self.bits.bytes();
        for i in 0..self.hash_count as u64 {
            let pos = (h1 as u64 + i * h2 as u64) % m;
            if bits[(pos / 8) as usize] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn element_count(&self) -> u64 {
        self.element_count
    }

    /// Write header + bits to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE];
        BigEndian::write_i64(&mut header[0..8], self.size_bits as i64);
        BigEndian::write_i64(&mut header[8..16], self.hash_count as i64);
        BigEndian::write_i64(&mut header[16..24], self.element_count as i64);

        let mut f = File::create(path)?;
        f.write_all(&header)?;
        f.write_all(self.bits.bytes())?;
        Ok(())
    }

    fn parse_header(data: &[u8]) -> Result<(usize, u32, u64)> {
        if data.len() < HEADER_SIZE {
            return Err(CidxError::IndexCorrupt("bloom file too short".into()));
        }
        let size_bits = BigEndian::read_i64(&data[0..8]);
        let hash_count = BigEndian::read_i64(&data[8..16]);
        let element_count = BigEndian::read_i64(&data[16..24]);
        if size_bits <= 0
            || hash_count <= 0
            || element_count < 0
            || data.len() - HEADER_SIZE < (size_bits as usize + 7) / 8
        {
            return Err(CidxError::IndexCorrupt("bloom header invalid".into()));
        }
        Ok((size_bits as usize, hash_count as u32, element_count as u64))
    }

    /// Load a filter into an owned buffer.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let (size_bits, hash_count, element_count) = Self::parse_header(&data)?;
        Ok(Self {
            bits: Bits::Owned(data[HEADER_SIZE..].to_vec()),
            size_bits,
            hash_count,
            element_count,
        })
    }

    /// Map the filter file read-only. The mapping is owned by the returned
    /// filter and released when it is dropped.
    pub fn load_mmap(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: read-only private mapping of an index sidecar.
        let mmap = unsafe { Mmap::map(&file)? };
        let (size_bits, hash_count, element_count) = Self::parse_header(&mmap)?;
        Ok(Self {
            bits: Bits::Mapped(mmap),
            size_bits,
            hash_count,
            element_count,
        })
    }
}

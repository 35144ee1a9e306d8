//! Read side of a built index: footer binary search, bloom pre-check and
//! streaming iteration over matching records.

use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;

use crate::index::block::{BlockMeta, BlockReader, SparseFooter};
use crate::index::bloom::BloomFilter;
use crate::storage::record::{IndexRecord, KEY_SIZE};
use crate::Result;

/// Compare a padded record key against a search key, ignoring the zero
/// padding on the record side.
pub fn compare_record_key(key: &[u8; KEY_SIZE], search: &[u8]) -> Ordering {
    let mut len = KEY_SIZE;
    while len > 0 && key[len - 1] == 0 {
        len -= 1;
    }
    key[..len].cmp(search)
}

/// An opened `.cidx` file plus its bloom sidecar when one exists.
pub struct DiskIndex {
    reader: BlockReader<File>,
    bloom: Option<BloomFilter>,
}

impl DiskIndex {
    /// Open an index file; the `.bloom` sidecar is mapped when present and
    /// stays mapped for the life of this value.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BlockReader::open(file)?;

        let mut bloom_os = path.as_os_str().to_os_string();
        bloom_os.push(".bloom");
        let bloom_path = std::path::PathBuf::from(bloom_os);
        let bloom = if bloom_path.exists() {
            match BloomFilter::load_mmap(&bloom_path) {
                Ok(b) => Some(b),
                Err(e) => {
                    log::debug!("ignoring unreadable bloom sidecar {}: {e}", bloom_path.display());
                    None
                }
            }
        } else {
            None
        };

        Ok(Self { reader, bloom })
    }

    pub fn footer(&self) -> &SparseFooter {
        self.reader.footer()
    }

    /// Total records according to the directory, or `None` when any block
    /// reports a zero count (directory not usable as a row count).
    pub fn approximate_count(&self) -> Option<i64> {
        let mut total = 0;
        for block in &self.footer().blocks {
            if block.record_count == 0 {
                return None;
            }
            total += block.record_count;
        }
        Some(total)
    }

    /// Bloom pre-check; true when no bloom sidecar is present.
    pub fn might_contain(&self, key: &str) -> bool {
        self.bloom.as_ref().map_or(true, |b| b.might_contain(key.as_bytes()))
    }

    /// Leftmost block whose records can contain `key`: the rightmost
    /// directory entry with `start_key <= key`, backed up across duplicate
    /// start keys equal to `key`.
    pub fn find_start_block(&self, key: &str) -> Option<usize> {
        let blocks = &self.footer().blocks;
        let mut left = 0i64;
        let mut right = blocks.len() as i64 - 1;
        let mut result = -1i64;
        while left <= right {
            let mid = (left + right) / 2;
            if blocks[mid as usize].start_key.as_str() <= key {
                result = mid;
                left = mid + 1;
            } else {
                right = mid - 1;
            }
        }
        if result < 0 {
            return None;
        }
        let mut idx = result as usize;
        if blocks[idx].start_key == key {
            while idx > 0 && blocks[idx - 1].start_key == key {
                idx -= 1;
            }
        }
        Some(idx)
    }

    pub fn read_block(&mut self, meta: &BlockMeta) -> Result<&[IndexRecord]> {
        self.reader.read_block(meta)
    }

    /// Stream every record whose trimmed key equals `key`. The bloom
    /// filter short-circuits definite misses without touching any block.
    pub fn search(&mut self, key: &str) -> KeyScan<'_> {
        if !self.might_contain(key) {
            return KeyScan::empty(self);
        }
        match self.find_start_block(key) {
            Some(start) => KeyScan {
                search_key: Some(key.as_bytes().to_vec()),
                current_block: start,
                idx: self,
                records: Vec::new(),
                record_index: 0,
                done: false,
            },
            None => KeyScan::empty(self),
        }
    }

    /// Stream every record in index order.
    pub fn scan(&mut self) -> KeyScan<'_> {
        KeyScan {
            idx: self,
            search_key: None,
            current_block: 0,
            records: Vec::new(),
            record_index: 0,
            done: false,
        }
    }
}

/// Streaming iterator over index records, optionally bounded to one key.
pub struct KeyScan<'a> {
    idx: &'a mut DiskIndex,
    search_key: Option<Vec<u8>>,
    current_block: usize,
    records: Vec<IndexRecord>,
    record_index: usize,
    done: bool,
}

impl<'a> KeyScan<'a> {
    fn empty(idx: &'a mut DiskIndex) -> Self {
        Self {
            idx,
            search_key: None,
            current_block: 0,
            records: Vec::new(),
            record_index: 0,
            done: true,
        }
    }

    /// Next matching record, or `None` once the key range is exhausted.
    pub fn next(&mut self) -> Result<Option<IndexRecord>> {
        if self.done {
            return Ok(None);
        }

        loop {
            if self.record_index >= self.records.len() {
                let total = self.idx.footer().blocks.len();
                if self.current_block >= total {
                    self.done = true;
                    return Ok(None);
                }
                let meta = self.idx.footer().blocks[self.current_block].clone();
                if let Some(key) = &self.search_key {
                    if meta.start_key.as_bytes() > key.as_slice() {
                        self.done = true;
                        return Ok(None);
                    }
                }
                self.records = self.idx.read_block(&meta)?.to_vec();
                self.record_index = 0;
                self.current_block += 1;
                continue;
            }

            let rec = self.records[self.record_index];
            self.record_index += 1;

            match &self.search_key {
                None => return Ok(Some(rec)),
                Some(key) => match compare_record_key(&rec.key, key) {
                    // the found range's first block may begin with lesser keys
                    Ordering::Less => continue,
                    Ordering::Equal => return Ok(Some(rec)),
                    Ordering::Greater => {
                        self.done = true;
                        return Ok(None);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::block::BlockWriter;
    use std::io::BufWriter;

    fn build_index(path: &Path, recs: &[IndexRecord]) {
        let file = File::create(path).unwrap();
        let mut w = BlockWriter::new(BufWriter::new(file)).unwrap();
        for r in recs {
            w.write_record(*r).unwrap();
        }
        w.close().unwrap();
    }

    fn sorted_records() -> Vec<IndexRecord> {
        let mut recs = Vec::new();
        for i in 0..2000i64 {
            recs.push(IndexRecord::new(format!("key{:04}", i / 4).as_bytes(), i * 10, i + 2));
        }
        recs
    }

    #[test]
    fn test_search_exact_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cidx");
        build_index(&path, &sorted_records());

        let mut idx = DiskIndex::open(&path).unwrap();
        let mut scan = idx.search("key0123");
        let mut hits = Vec::new();
        while let Some(rec) = scan.next().unwrap() {
            hits.push(rec);
        }
        assert_eq!(hits.len(), 4);
        for rec in &hits {
            assert_eq!(rec.trimmed_key(), b"key0123");
        }
        // offsets ascend within the key
        assert!(hits.windows(2).all(|p| p[0].offset < p[1].offset));
    }

    #[test]
    fn test_search_absent_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cidx");
        build_index(&path, &sorted_records());

        let mut idx = DiskIndex::open(&path).unwrap();
        let mut scan = idx.search("zzz");
        assert!(scan.next().unwrap().is_none());

        let mut scan = idx.search("aaa");
        assert!(scan.next().unwrap().is_none());
    }

    #[test]
    fn test_full_scan_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cidx");
        let recs = sorted_records();
        build_index(&path, &recs);

        let mut idx = DiskIndex::open(&path).unwrap();
        assert_eq!(idx.approximate_count(), Some(2000));
        let mut scan = idx.scan();
        let mut n = 0;
        let mut last: Option<IndexRecord> = None;
        while let Some(rec) = scan.next().unwrap() {
            if let Some(prev) = last {
                assert_ne!(
                    prev.key.cmp(&rec.key).then(prev.offset.cmp(&rec.offset)),
                    Ordering::Greater
                );
            }
            last = Some(rec);
            n += 1;
        }
        assert_eq!(n, 2000);
    }

    #[test]
    fn test_duplicate_start_key_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cidx");
        // one key spanning multiple blocks: every block starts with "dup"
        let recs: Vec<IndexRecord> =
            (0..1700i64).map(|i| IndexRecord::new(b"dup", i, i + 2)).collect();
        build_index(&path, &recs);

        let mut idx = DiskIndex::open(&path).unwrap();
        assert!(idx.footer().blocks.len() > 1);
        assert_eq!(idx.find_start_block("dup"), Some(0));

        let mut scan = idx.search("dup");
        let mut n = 0;
        while let Some(_rec) = scan.next().unwrap() {
            n += 1;
        }
        assert_eq!(n, 1700);
    }

    #[test]
    fn test_bloom_sidecar_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.cidx");
        build_index(&path, &sorted_records());

        let mut bloom = BloomFilter::new(1000, 0.01);
        for i in 0..500 {
            bloom.insert(format!("key{i:04}").as_bytes());
        }
        bloom.save(&dir.path().join("t.cidx.bloom")).unwrap();

        let mut idx = DiskIndex::open(&path).unwrap();
        assert!(idx.might_contain("key0001"));
        assert!(!idx.might_contain("NONEXISTENT_12345"));
        let mut scan = idx.search("NONEXISTENT_12345");
        assert!(scan.next().unwrap().is_none());
    }

    #[test]
    fn test_compare_record_key_trims_padding() {
        let rec = IndexRecord::new(b"abc", 0, 2);
        assert_eq!(compare_record_key(&rec.key, b"abc"), Ordering::Equal);
        assert_eq!(compare_record_key(&rec.key, b"abd"), Ordering::Less);
        assert_eq!(compare_record_key(&rec.key, b"ab"), Ordering::Greater);
    }
}

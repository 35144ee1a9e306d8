//! Bounded-memory external sorter.
//!
//! Records accumulate in memory until the chunk size is reached, are
//! sorted by `(key, offset)` and spilled to LZ4-framed temp files, and a
//! final k-way heap merge streams the total order through a block writer.
//! Distinct keys are counted during the merge and, when configured, fed
//! into a bloom filter.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::index::block::BlockWriter;
use crate::index::bloom::BloomFilter;
use crate::storage::record::{self, IndexRecord};
use crate::Result;

/// Sorts one index's records out of core and writes the `.cidx` output.
pub struct ExternalSorter {
    name: String,
    output_path: PathBuf,
    temp_dir: PathBuf,
    chunk_size: usize,
    chunk_files: Vec<PathBuf>,
    mem_buffer: Vec<IndexRecord>,
    bloom: Option<BloomFilter>,
    scratch: Vec<u8>,
}

impl ExternalSorter {
    /// `memory_limit` is the byte budget for this index; the spill chunk
    /// size is derived from it with a floor of 1000 records.
    pub fn new(
        name: &str,
        output_path: &Path,
        temp_dir: &Path,
        memory_limit: usize,
        bloom: Option<BloomFilter>,
    ) -> Self {
        let chunk_size = (memory_limit / 100).max(1000);
        Self {
            name: name.to_string(),
            output_path: output_path.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            chunk_size,
            chunk_files: Vec::new(),
            mem_buffer: Vec::with_capacity(chunk_size),
            bloom,
            scratch: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, record: IndexRecord) -> Result<()> {
        self.mem_buffer.push(record);
        if self.mem_buffer.len() >= self.chunk_size {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.mem_buffer.is_empty() {
            return Ok(());
        }

        self.mem_buffer
            .sort_unstable_by(|a, b| a.key.cmp(&b.key).then(a.offset.cmp(&b.offset)));

        let chunk_path = self.temp_dir.join(format!("chunk_{}.tmp", self.chunk_files.len()));
        let file = File::create(&chunk_path)?;
        let mut enc = FrameEncoder::new(BufWriter::new(file));
        record::write_batch(&mut enc, &self.mem_buffer, &mut self.scratch)?;
        let mut buffered = enc
            .finish()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        buffered.flush()?;

        self.chunk_files.push(chunk_path);
        self.mem_buffer.clear();
        Ok(())
    }

    /// Flush the tail, merge all chunks into the output file and return the
    /// distinct key count together with the (now populated) bloom filter.
    pub fn finalize(mut self) -> Result<(i64, Option<BloomFilter>)> {
        self.flush_chunk()?;

        if self.chunk_files.is_empty() {
            File::create(&self.output_path)?;
            return Ok((0, self.bloom.take()));
        }

        let distinct = self.k_way_merge()?;
        Ok((distinct, self.bloom.take()))
    }

    fn k_way_merge(&mut self) -> Result<i64> {
        let mut readers = Vec::with_capacity(self.chunk_files.len());
        for path in &self.chunk_files {
            readers.push(FrameDecoder::new(BufReader::new(File::open(path)?)));
        }

        let out = File::create(&self.output_path)?;
        let mut writer = BlockWriter::new(BufWriter::new(out))?;

        let mut heap: BinaryHeap<Reverse<MergeItem>> = BinaryHeap::with_capacity(readers.len());
        for (source, reader) in readers.iter_mut().enumerate() {
            if let Some(rec) = record::read_record(reader)? {
                heap.push(Reverse(MergeItem { rec, source }));
            }
        }

        let mut distinct = 0i64;
        let mut last_key = [0u8; 64];
        let mut first = true;

        while let Some(Reverse(item)) = heap.pop() {
            let rec = item.rec;

            if first || rec.key != last_key {
                distinct += 1;
                if let Some(bloom) = self.bloom.as_mut() {
                    bloom.insert(rec.trimmed_key());
                }
                last_key = rec.key;
                first = false;
            }

            writer.write_record(rec)?;

            if let Some(next) = record::read_record(&mut readers[item.source])? {
                heap.push(Reverse(MergeItem { rec: next, source: item.source }));
            }
        }

        writer.close()?;
        Ok(distinct)
    }

    /// Remove any remaining spill chunks. Also runs on drop.
    pub fn cleanup(&mut self) {
        for path in self.chunk_files.drain(..) {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for ExternalSorter {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct MergeItem {
    rec: IndexRecord,
    source: usize,
}

impl PartialEq for MergeItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeItem {}

impl PartialOrd for MergeItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rec
            .key
            .cmp(&other.rec.key)
            .then(self.rec.offset.cmp(&other.rec.offset))
            .then(self.source.cmp(&other.source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::block::BlockReader;

    fn sorter_in(dir: &Path, bloom: Option<BloomFilter>) -> ExternalSorter {
        ExternalSorter::new("dept", &dir.join("out.cidx"), dir, 0, bloom)
    }

    fn read_all(path: &Path) -> Vec<IndexRecord> {
        let mut reader = BlockReader::open(File::open(path).unwrap()).unwrap();
        let metas = reader.footer().blocks.clone();
        let mut out = Vec::new();
        for meta in &metas {
            out.extend_from_slice(reader.read_block(meta).unwrap());
        }
        out
    }

    #[test]
    fn test_spill_and_merge_total_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = sorter_in(dir.path(), None);
        // chunk floor is 1000 records → 2500 records spill three chunks
        for i in 0..2500i64 {
            let key = format!("key-{:03}", (i * 37) % 500);
            sorter.add(IndexRecord::new(key.as_bytes(), i * 10, i + 2)).unwrap();
        }
        let (distinct, _) = sorter.finalize().unwrap();
        assert_eq!(distinct, 500);

        let recs = read_all(&dir.path().join("out.cidx"));
        assert_eq!(recs.len(), 2500);
        for pair in recs.windows(2) {
            let ord = pair[0].key.cmp(&pair[1].key).then(pair[0].offset.cmp(&pair[1].offset));
            assert_ne!(ord, Ordering::Greater, "merge output out of order");
        }
    }

    #[test]
    fn test_empty_input_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let sorter = sorter_in(dir.path(), None);
        let (distinct, _) = sorter.finalize().unwrap();
        assert_eq!(distinct, 0);
        let meta = std::fs::metadata(dir.path().join("out.cidx")).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn test_chunk_files_removed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sorter = sorter_in(dir.path(), None);
            for i in 0..1500i64 {
                sorter.add(IndexRecord::new(b"k", i, i + 2)).unwrap();
            }
            let _ = sorter.finalize().unwrap();
        }
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_bloom_fed_with_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = sorter_in(dir.path(), Some(BloomFilter::new(1000, 0.01)));
        for i in 0..1200i64 {
            sorter.add(IndexRecord::new(format!("d{}", i % 7).as_bytes(), i, i + 2)).unwrap();
        }
        let (distinct, bloom) = sorter.finalize().unwrap();
        assert_eq!(distinct, 7);
        let bloom = bloom.unwrap();
        assert_eq!(bloom.element_count(), 7);
        for i in 0..7 {
            assert!(bloom.might_contain(format!("d{i}").as_bytes()));
        }
    }

    #[test]
    fn test_ties_ordered_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = sorter_in(dir.path(), None);
        for offset in [50i64, 10, 30, 20, 40] {
            sorter.add(IndexRecord::new(b"same", offset, 2)).unwrap();
        }
        let _ = sorter.finalize().unwrap();
        let recs = read_all(&dir.path().join("out.cidx"));
        let offsets: Vec<i64> = recs.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![10, 20, 30, 40, 50]);
    }
}

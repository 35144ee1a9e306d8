//! Build orchestration: scan → per-index fan-out → external sort →
//! index + bloom + metadata sidecar.
//!
//! One sorter task runs per index group, fed through a bounded channel of
//! record batches so a slow sorter back-pressures the scan. Index files
//! are produced inside a temp directory and renamed into place once their
//! sorter finishes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::index::bloom::BloomFilter;
use crate::index::sorter::ExternalSorter;
use crate::parser::{CsvScanner, RowSink};
use crate::storage::record::IndexRecord;
use crate::{CidxError, Result};

/// Records per batch handed from a scan worker to a sorter task.
const BATCH_SIZE: usize = 1000;

/// Bounded capacity of each scanner → sorter channel, in batches.
const BATCH_QUEUE_DEPTH: usize = 100;

/// Expected distinct-key capacity used to size every bloom filter.
const BLOOM_CAPACITY: usize = 10_000_000;

const MIN_MEMORY_PER_INDEX: usize = 10 * 1024 * 1024;

/// Configuration for one index build.
#[derive(Debug, Clone)]
pub struct IndexBuildConfig {
    pub input_file: PathBuf,
    pub output_dir: PathBuf,
    /// JSON array; each element is a column name or an array of names
    /// (composite index), e.g. `["dept", ["dept", "name"]]`.
    pub columns: String,
    pub separator: u8,
    /// 0 selects the scanner default (available parallelism).
    pub workers: usize,
    pub memory_mb: usize,
    /// Bloom false-positive rate; 0 disables the sidecar.
    pub bloom_fp_rate: f64,
}

impl Default for IndexBuildConfig {
    fn default() -> Self {
        Self {
            input_file: PathBuf::new(),
            output_dir: PathBuf::new(),
            columns: String::new(),
            separator: b',',
            workers: 0,
            memory_mb: 256,
            bloom_fp_rate: 0.01,
        }
    }
}

/// Per-index summary recorded in the metadata sidecar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub distinct_count: i64,
    pub file_size: i64,
}

/// Metadata sidecar written next to the index files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub captured_at: DateTime<Utc>,
    pub total_rows: i64,
    pub csv_size: i64,
    pub csv_mtime: i64,
    pub csv_hash: String,
    pub indexes: BTreeMap<String, IndexStats>,
}

/// Orchestrates one build run.
pub struct IndexManager {
    config: IndexBuildConfig,
}

impl IndexManager {
    pub fn new(config: IndexBuildConfig) -> Self {
        Self { config }
    }

    /// Run the build and return the metadata that was written.
    pub fn run(&self) -> Result<IndexMeta> {
        let col_defs = parse_columns(&self.config.columns)?;

        fs::create_dir_all(&self.config.output_dir)?;
        let temp_dir = self.config.output_dir.join(".cidx_tmp");
        fs::create_dir_all(&temp_dir)?;
        let _temp_guard = TempDirGuard(temp_dir.clone());

        let mut scanner = CsvScanner::open(&self.config.input_file, self.config.separator)?;
        if self.config.workers > 0 {
            scanner.set_workers(self.config.workers);
        }
        for cols in &col_defs {
            scanner.validate_columns(cols)?;
        }

        let col_indices: Vec<Vec<usize>> = col_defs
            .iter()
            .map(|cols| {
                cols.iter()
                    // validated above, lookups cannot miss
                    .map(|c| scanner.column_index(c).unwrap())
                    .collect()
            })
            .collect();
        let names: Vec<String> = col_defs
            .iter()
            .map(|cols| cols.join("_").to_lowercase())
            .collect();

        let csv_base = csv_basename(&self.config.input_file);
        let memory_per_index =
            (self.config.memory_mb * 1024 * 1024 / col_defs.len()).max(MIN_MEMORY_PER_INDEX);

        let stats: Mutex<BTreeMap<String, IndexStats>> = Mutex::new(BTreeMap::new());
        let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

        let scan_result = std::thread::scope(|scope| {
            let mut senders: Vec<Sender<Vec<IndexRecord>>> = Vec::with_capacity(names.len());
            for name in &names {
                let (tx, rx) = bounded::<Vec<IndexRecord>>(BATCH_QUEUE_DEPTH);
                senders.push(tx);

                let final_path = self
                    .config
                    .output_dir
                    .join(format!("{csv_base}_{name}.cidx"));
                let temp_root = temp_dir.clone();
                let bloom_fp_rate = self.config.bloom_fp_rate;
                let stats = &stats;
                let failures = &failures;
                scope.spawn(move || {
                    match run_sorter_node(name, rx, &final_path, &temp_root, memory_per_index, bloom_fp_rate) {
                        Ok(s) => {
                            stats.lock().insert(name.clone(), s);
                        }
                        Err(e) => {
                            failures.lock().push(format!("{name}: {e}"));
                        }
                    }
                });
            }

            let workers = scanner.workers();
            let mut sinks: Vec<RecordBatcher> = (0..workers)
                .map(|_| RecordBatcher::new(senders.clone()))
                .collect();
            let result = scanner.scan(&col_indices, &mut sinks);
            for sink in &mut sinks {
                sink.flush();
            }
            // dropping every sender closes the channels and lets the
            // sorter tasks finalize; the scope joins them
            drop(sinks);
            drop(senders);
            result
        });
        scan_result?;

        let failures = failures.into_inner();
        if !failures.is_empty() {
            return Err(CidxError::BuildFailed(failures.join("; ")));
        }

        let (total_rows, _bytes) = scanner.stats();
        let (csv_size, csv_mtime, csv_hash) = fingerprint(&self.config.input_file)?;

        let meta = IndexMeta {
            captured_at: Utc::now(),
            total_rows,
            csv_size,
            csv_mtime,
            csv_hash,
            indexes: stats.into_inner(),
        };
        let meta_path = self.config.output_dir.join(format!("{csv_base}_meta.json"));
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| CidxError::BuildFailed(format!("metadata encode: {e}")))?;
        fs::write(meta_path, meta_bytes)?;

        Ok(meta)
    }
}

/// One sorter task: drain batches from the channel, finalize into the temp
/// directory, then move the index (and bloom) into place.
fn run_sorter_node(
    name: &str,
    rx: Receiver<Vec<IndexRecord>>,
    final_path: &Path,
    temp_root: &Path,
    memory_limit: usize,
    bloom_fp_rate: f64,
) -> Result<IndexStats> {
    let sort_dir = temp_root.join(format!("sort_{name}"));
    fs::create_dir_all(&sort_dir)?;

    // final file name, staged inside the temp dir
    let file_name = final_path
        .file_name()
        .ok_or_else(|| CidxError::BadRequest("index path has no file name".into()))?;
    let temp_index = sort_dir.join(file_name);

    let bloom = (bloom_fp_rate > 0.0).then(|| BloomFilter::new(BLOOM_CAPACITY, bloom_fp_rate));
    let mut sorter = ExternalSorter::new(name, &temp_index, &sort_dir, memory_limit, bloom);

    for batch in rx.iter() {
        for rec in batch {
            sorter.add(rec)?;
        }
    }

    let (distinct_count, bloom) = sorter.finalize()?;

    fs::rename(&temp_index, final_path)?;
    if let Some(bloom) = bloom {
        let temp_bloom = sort_dir.join("filter.bloom");
        bloom.save(&temp_bloom)?;
        let mut bloom_os = final_path.as_os_str().to_os_string();
        bloom_os.push(".bloom");
        fs::rename(&temp_bloom, PathBuf::from(bloom_os))?;
    }

    let file_size = fs::metadata(final_path)?.len() as i64;
    Ok(IndexStats {
        distinct_count,
        file_size,
    })
}

/// Per-worker sink: local buffers per index, flushed through the bounded
/// channels in whole batches. Key bytes are copied into fixed records at
/// the hand-off, so the worker scratch buffers can be reused immediately.
struct RecordBatcher {
    senders: Vec<Sender<Vec<IndexRecord>>>,
    bufs: Vec<Vec<IndexRecord>>,
}

impl RecordBatcher {
    fn new(senders: Vec<Sender<Vec<IndexRecord>>>) -> Self {
        let bufs = senders.iter().map(|_| Vec::with_capacity(BATCH_SIZE)).collect();
        Self { senders, bufs }
    }

    fn flush(&mut self) {
        for (i, buf) in self.bufs.iter_mut().enumerate() {
            if !buf.is_empty() {
                let _ = self.senders[i].send(std::mem::take(buf));
            }
        }
    }
}

impl RowSink for RecordBatcher {
    fn row(&mut self, keys: &[&[u8]], offset: i64, line: i64) {
        for (i, key) in keys.iter().enumerate() {
            let buf = &mut self.bufs[i];
            buf.push(IndexRecord::new(key, offset, line));
            if buf.len() >= BATCH_SIZE {
                let batch = std::mem::replace(buf, Vec::with_capacity(BATCH_SIZE));
                // a send can only fail once the sorter has already
                // errored; the failure surfaces when the task is joined
                let _ = self.senders[i].send(batch);
            }
        }
    }
}

/// CSV file name without its final extension, as used in all sidecar names.
pub fn csv_basename(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parse_columns(spec: &str) -> Result<Vec<Vec<String>>> {
    let raw: serde_json::Value = serde_json::from_str(spec)
        .map_err(|e| CidxError::BadRequest(format!("columns JSON: {e}")))?;

    let items = raw
        .as_array()
        .ok_or_else(|| CidxError::BadRequest("columns must be a JSON array".into()))?;

    let mut defs = Vec::new();
    for item in items {
        match item {
            serde_json::Value::String(s) => defs.push(vec![s.clone()]),
            serde_json::Value::Array(parts) => {
                let cols: Vec<String> = parts
                    .iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect();
                if !cols.is_empty() {
                    defs.push(cols);
                }
            }
            _ => {}
        }
    }
    if defs.is_empty() {
        return Err(CidxError::BadRequest("no valid column definitions found".into()));
    }
    Ok(defs)
}

/// SHA-1 over up to three 512 KiB windows (head, middle, tail) plus the
/// file size and mtime. A cheap staleness hint, not an integrity check.
fn fingerprint(path: &Path) -> Result<(i64, i64, String)> {
    const SAMPLE: i64 = 512 * 1024;

    let mut file = File::open(path)?;
    let meta = file.metadata()?;
    let size = meta.len() as i64;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; SAMPLE as usize];

    let mut hash_window = |file: &mut File, offset: i64, buf: &mut [u8], hasher: &mut Sha1| -> Result<()> {
        file.seek(SeekFrom::Start(offset.max(0) as u64))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        hasher.update(&buf[..filled]);
        Ok(())
    };

    hash_window(&mut file, 0, &mut buf, &mut hasher)?;
    if size > SAMPLE * 3 {
        hash_window(&mut file, size / 2 - SAMPLE / 2, &mut buf, &mut hasher)?;
    }
    if size > SAMPLE {
        hash_window(&mut file, size - SAMPLE, &mut buf, &mut hasher)?;
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok((size, mtime, hex))
}

struct TempDirGuard(PathBuf);

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

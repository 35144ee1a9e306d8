//! Chunked parallel CSV scanner over a memory-mapped file.
//!
//! The body after the header is divided into one chunk per worker, cut at
//! quote-safe record boundaries. A cheap pre-pass counts newline bytes per
//! chunk so a prefix sum can hand every worker its starting physical line
//! number; the main pass then walks the quote/newline bitmaps with
//! trailing-zero scans and emits `(keys, offset, line)` per record into a
//! per-worker sink.
//!
//! Line numbers are physical: the header is line 1, and every `\n` byte
//! (including newlines inside quoted fields) advances the counter. A row's
//! line number is the line on which its first byte sits, which keeps index
//! records consistent with line-oriented tooling and the update sidecar.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use ahash::AHashMap;
use rayon::prelude::*;

use crate::parser::classify::{self, words_for};
use crate::storage::MappedFile;
use crate::{CidxError, Result};

/// Per-worker receiver of scanned rows.
///
/// `keys` holds one entry per index definition: single-column keys are
/// slices into the mapped file, composite keys point into a worker-local
/// scratch buffer that is overwritten on the next row. Implementations
/// must copy whatever they keep before returning.
pub trait RowSink: Send {
    fn row(&mut self, keys: &[&[u8]], offset: i64, line: i64);
}

/// Parallel scanner over one mapped CSV file.
pub struct CsvScanner {
    mapped: MappedFile,
    separator: u8,
    headers: Vec<String>,
    header_map: AHashMap<String, usize>,
    workers: usize,
    rows_scanned: AtomicI64,
    bytes_scanned: AtomicI64,
}

impl CsvScanner {
    /// Open and map the CSV, parsing the header line.
    pub fn open(path: &Path, separator: u8) -> Result<Self> {
        let mapped = MappedFile::open(path)?;
        let mut scanner = Self {
            mapped,
            separator,
            headers: Vec::new(),
            header_map: AHashMap::new(),
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            rows_scanned: AtomicI64::new(0),
            bytes_scanned: AtomicI64::new(0),
        };
        scanner.read_headers()?;
        Ok(scanner)
    }

    fn read_headers(&mut self) -> Result<()> {
        let data = self.mapped.data();
        let nl = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| CidxError::EmptyCsv(self.mapped.path().display().to_string()))?;

        let mut line = &data[..nl];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        // UTF-8 BOM is stripped from the header only
        if line.len() >= 3 && line[0] == 0xEF && line[1] == 0xBB && line[2] == 0xBF {
            line = &line[3..];
        }

        for part in line.split(|&b| b == self.separator) {
            let mut name = String::from_utf8_lossy(part).trim().to_string();
            if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
                name = name[1..name.len() - 1].to_string();
            }
            self.header_map.insert(name.to_lowercase(), self.headers.len());
            self.headers.push(name);
        }
        Ok(())
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Case-insensitive column lookup.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header_map.get(name.trim().to_lowercase().as_str()).copied()
    }

    /// Check that every named column exists in the header.
    pub fn validate_columns(&self, columns: &[String]) -> Result<()> {
        for col in columns {
            if self.column_index(col).is_none() {
                return Err(CidxError::ColumnNotFound(col.clone()));
            }
        }
        Ok(())
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn set_workers(&mut self, n: usize) {
        if n > 0 {
            self.workers = n;
        }
    }

    /// Running counters, valid during and after `scan`.
    pub fn stats(&self) -> (i64, i64) {
        (
            self.rows_scanned.load(Ordering::Relaxed),
            self.bytes_scanned.load(Ordering::Relaxed),
        )
    }

    /// Scan all data rows, invoking one sink per worker.
    ///
    /// `index_defs` lists the column indices each index key is built from;
    /// `sinks` must hold exactly `workers()` entries.
    pub fn scan<S: RowSink>(&self, index_defs: &[Vec<usize>], sinks: &mut [S]) -> Result<()> {
        assert_eq!(sinks.len(), self.workers, "one sink per worker");
        let data = self.mapped.data();

        let start = match data.iter().position(|&b| b == b'\n') {
            Some(nl) => nl + 1,
            None => return Ok(()),
        };
        if start >= data.len() {
            return Ok(());
        }

        let workers = self.workers;
        let chunk_size = (data.len() - start) / workers;

        let mut boundaries = vec![data.len(); workers + 1];
        boundaries[0] = start;
        for (i, b) in boundaries.iter_mut().enumerate().take(workers).skip(1) {
            let hint = start + i * chunk_size;
            if hint < data.len() {
                *b = find_safe_record_boundary(data, hint);
            }
        }

        // Pre-pass: physical newlines per chunk, prefix-summed into each
        // chunk's starting line (header is line 1, data starts at 2).
        let counts: Vec<i64> = (0..workers)
            .into_par_iter()
            .map(|i| {
                let (s, e) = (boundaries[i], boundaries[i + 1]);
                if s >= e {
                    0
                } else {
                    data[s..e].iter().filter(|&&b| b == b'\n').count() as i64
                }
            })
            .collect();
        let mut start_lines = vec![0i64; workers];
        let mut current = 2i64;
        for (i, count) in counts.iter().enumerate() {
            start_lines[i] = current;
            current += count;
        }

        std::thread::scope(|scope| {
            for (i, sink) in sinks.iter_mut().enumerate() {
                let (s, e) = (boundaries[i], boundaries[i + 1]);
                if s >= e {
                    continue;
                }
                let start_line = start_lines[i];
                scope.spawn(move || {
                    self.process_chunk(s, e, start_line, index_defs, sink);
                });
            }
        });

        self.bytes_scanned.store(data.len() as i64, Ordering::Relaxed);
        Ok(())
    }

    fn process_chunk<S: RowSink>(
        &self,
        start: usize,
        end: usize,
        start_line: i64,
        index_defs: &[Vec<usize>],
        sink: &mut S,
    ) {
        let data = self.mapped.data();
        let end = end.min(data.len());
        if start >= end {
            return;
        }
        let chunk = &data[start..end];

        let max_cols = index_defs
            .iter()
            .flat_map(|d| d.iter())
            .max()
            .map(|&m| m + 1)
            .unwrap_or(0);

        let words = words_for(chunk.len());
        let mut quotes = vec![0u64; words];
        let mut seps = vec![0u64; words];
        let mut newlines = vec![0u64; words];
        classify::classify(chunk, self.separator, &mut quotes, &mut seps, &mut newlines);

        let mut values: Vec<Option<&[u8]>> = vec![None; max_cols];
        let mut scratch: Vec<u8> = Vec::with_capacity(1024);
        let mut spans: Vec<(usize, usize)> = Vec::with_capacity(index_defs.len());

        let mut local_rows = 0i64;
        let mut local_bytes = 0i64;
        let mut line_start = 0usize;
        let mut in_quote = false;
        let mut row_line = start_line;
        let mut quoted_newlines = 0i64;

        for word_idx in 0..words {
            let quote_mask = quotes[word_idx];
            let newline_mask = newlines[word_idx];
            if quote_mask == 0 && newline_mask == 0 {
                continue;
            }

            let mut combined = quote_mask | newline_mask;
            while combined != 0 {
                let tz = combined.trailing_zeros() as usize;
                let bit = 1u64 << tz;
                combined &= !bit;

                let byte_pos = word_idx * 64 + tz;
                if byte_pos >= chunk.len() {
                    break;
                }

                if quote_mask & bit != 0 {
                    in_quote = !in_quote;
                    continue;
                }

                // newline
                if in_quote {
                    quoted_newlines += 1;
                    continue;
                }

                let mut line_bytes = &chunk[line_start..byte_pos];
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes = &line_bytes[..line_bytes.len() - 1];
                }
                if !line_bytes.is_empty() {
                    self.emit_row(
                        line_bytes,
                        line_start,
                        (start + line_start) as i64,
                        row_line,
                        index_defs,
                        max_cols,
                        &quotes,
                        &seps,
                        &mut values,
                        &mut scratch,
                        &mut spans,
                        sink,
                    );
                    local_rows += 1;
                }
                local_bytes += (byte_pos - line_start + 1) as i64;
                row_line += 1 + quoted_newlines;
                quoted_newlines = 0;
                line_start = byte_pos + 1;
            }

            if word_idx % 1024 == 0 {
                self.rows_scanned.fetch_add(local_rows, Ordering::Relaxed);
                self.bytes_scanned.fetch_add(local_bytes, Ordering::Relaxed);
                local_rows = 0;
                local_bytes = 0;
            }
        }

        // Trailing row without a newline terminator
        if line_start < chunk.len() && !in_quote {
            let mut line_bytes = &chunk[line_start..];
            if line_bytes.last() == Some(&b'\r') {
                line_bytes = &line_bytes[..line_bytes.len() - 1];
            }
            if !line_bytes.is_empty() {
                self.emit_row(
                    line_bytes,
                    line_start,
                    (start + line_start) as i64,
                    row_line,
                    index_defs,
                    max_cols,
                    &quotes,
                    &seps,
                    &mut values,
                    &mut scratch,
                    &mut spans,
                    sink,
                );
                local_rows += 1;
            }
            local_bytes += (chunk.len() - line_start) as i64;
        }

        self.rows_scanned.fetch_add(local_rows, Ordering::Relaxed);
        self.bytes_scanned.fetch_add(local_bytes, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_row<'c, S: RowSink>(
        &self,
        line: &'c [u8],
        line_start_in_chunk: usize,
        offset: i64,
        row_line: i64,
        index_defs: &[Vec<usize>],
        max_cols: usize,
        quotes: &[u64],
        seps: &[u64],
        values: &mut Vec<Option<&'c [u8]>>,
        scratch: &mut Vec<u8>,
        spans: &mut Vec<(usize, usize)>,
        sink: &mut S,
    ) {
        values.clear();
        values.resize(max_cols, None);

        if max_cols > 0 {
            let mut col_idx = 0;
            let mut field_start = 0;
            let mut in_quote = false;
            let mut i = 0;
            while i < line.len() && col_idx < max_cols {
                let pos = line_start_in_chunk + i;
                if classify::bit_set(quotes, pos) {
                    in_quote = !in_quote;
                    i += 1;
                    continue;
                }
                if !in_quote && classify::bit_set(seps, pos) {
                    values[col_idx] = Some(strip_quotes(&line[field_start..i]));
                    col_idx += 1;
                    field_start = i + 1;
                }
                i += 1;
            }
            if col_idx < max_cols && field_start <= line.len() {
                values[col_idx] = Some(strip_quotes(&line[field_start..]));
            }
        }

        // Build composite representations first; the key slices reference
        // the scratch buffer afterwards, so it must not grow in between.
        scratch.clear();
        spans.clear();
        for def in index_defs {
            if def.len() > 1 {
                let begin = scratch.len();
                scratch.push(b'[');
                for (j, &ci) in def.iter().enumerate() {
                    if j > 0 {
                        scratch.push(b',');
                    }
                    scratch.push(b'"');
                    if let Some(v) = values.get(ci).copied().flatten() {
                        scratch.extend_from_slice(v);
                    }
                    scratch.push(b'"');
                }
                scratch.push(b']');
                spans.push((begin, scratch.len()));
            }
        }

        let mut span_idx = 0;
        let mut keys: Vec<&[u8]> = Vec::with_capacity(index_defs.len());
        for def in index_defs {
            if def.len() == 1 {
                keys.push(values.get(def[0]).copied().flatten().unwrap_or(b""));
            } else {
                let (a, b) = spans[span_idx];
                span_idx += 1;
                keys.push(&scratch[a..b]);
            }
        }

        sink.row(&keys, offset, row_line);
    }
}

/// Strip one pair of surrounding double quotes from a field value.
#[inline]
fn strip_quotes(v: &[u8]) -> &[u8] {
    if v.len() >= 2 && v[0] == b'"' && v[v.len() - 1] == b'"' {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

/// Advance from `hint` to the first record boundary that is not inside a
/// quoted field: the position just after a newline whose following segment
/// (up to the next newline) contains an even number of quote bytes.
fn find_safe_record_boundary(data: &[u8], hint: usize) -> usize {
    if hint >= data.len() {
        return data.len();
    }
    let next_nl = match data[hint..].iter().position(|&b| b == b'\n') {
        Some(p) => hint + p,
        None => return data.len(),
    };

    let mut current_nl = next_nl;
    loop {
        if current_nl + 1 >= data.len() {
            return data.len();
        }
        let next = match data[current_nl + 1..].iter().position(|&b| b == b'\n') {
            Some(p) => current_nl + 1 + p,
            None => return current_nl + 1,
        };
        let quote_count = data[current_nl + 1..next].iter().filter(|&&b| b == b'"').count();
        if quote_count % 2 == 0 {
            return current_nl + 1;
        }
        current_nl = next;
    }
}

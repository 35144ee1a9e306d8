//! Query planning and execution.
//!
//! Strategy selection, in order: `CountAll` when counting without filters,
//! `FullScan` whenever row overrides exist or no index matches, otherwise
//! an indexed scan: covered (no re-filter), re-filtering, or the group-by
//! directory fast path. Planner failures never surface: a missing or
//! unreadable index degrades to the full scan.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use rayon::prelude::*;
use serde::Serialize;

use crate::index::disk::{compare_record_key, DiskIndex};
use crate::index::manager::csv_basename;
use crate::query::aggregate::{AggFunc, StreamAggregator};
use crate::query::condition::Condition;
use crate::query::overrides::RowOverrides;
use crate::query::virtual_cols::VirtualColumns;
use crate::storage::MappedFile;
use crate::{CidxError, Result};

/// Most parallelism the CountAll newline count will use.
const COUNT_WORKERS: usize = 16;

/// One query's configuration.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub csv_path: PathBuf,
    /// Defaults to the CSV's directory.
    pub index_dir: Option<PathBuf>,
    pub separator: u8,
    pub group_by: String,
    pub agg_col: String,
    /// `count`, `sum`, `min`, `max`, `avg` or empty.
    pub agg_func: String,
    pub count_only: bool,
    /// 0 means unlimited.
    pub limit: i64,
    pub offset: i64,
    pub explain: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::new(),
            index_dir: None,
            separator: b',',
            group_by: String::new(),
            agg_col: String::new(),
            agg_func: String::new(),
            count_only: false,
            limit: 0,
            offset: 0,
            explain: false,
        }
    }
}

/// Chosen access path, also the `explain` output.
#[derive(Debug, Clone, Serialize)]
struct Plan {
    strategy: &'static str,
    index: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    covered_columns: Option<Vec<String>>,
    #[serde(skip)]
    index_path: PathBuf,
    #[serde(skip)]
    search_key: Option<String>,
}

/// Executes queries against one CSV and its index directory.
pub struct QueryExecutor {
    config: QueryConfig,
    virtual_cols: VirtualColumns,
}

impl QueryExecutor {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            config,
            virtual_cols: VirtualColumns::default(),
        }
    }

    /// Install defaults for columns the CSV lacks (virtual-column hook).
    pub fn with_virtual_columns(mut self, cols: VirtualColumns) -> Self {
        self.virtual_cols = cols;
        self
    }

    fn index_dir(&self) -> PathBuf {
        match &self.config.index_dir {
            Some(dir) => dir.clone(),
            None => self
                .config
                .csv_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Run the query, streaming results into `writer`.
    pub fn execute(&self, condition: Option<&Condition>, writer: &mut impl Write) -> Result<()> {
        if self.config.csv_path.as_os_str().is_empty() {
            return Err(CidxError::BadRequest("csv path required".into()));
        }
        let agg_func = AggFunc::parse(&self.config.agg_func)?;
        if agg_func != AggFunc::None && self.config.group_by.is_empty() {
            return Err(CidxError::BadRequest("agg_func requires group_by".into()));
        }
        if condition.is_none() && self.config.group_by.is_empty() && !self.config.count_only {
            return Err(CidxError::BadRequest(
                "no WHERE conditions or GROUP BY specified".into(),
            ));
        }

        let mut w = BufWriter::new(writer);

        if self.config.count_only && condition.is_none() && self.config.group_by.is_empty() {
            self.run_count_all(&mut w)?;
            return w.flush().map_err(Into::into);
        }

        // overrides are patched per row, which only the full scan can do
        let overrides = RowOverrides::load(&self.config.csv_path)?;
        if !overrides.is_empty() {
            self.run_full_scan(condition, &overrides, agg_func, &mut w)?;
            return w.flush().map_err(Into::into);
        }

        let Some(plan) = self.find_best_index(condition) else {
            self.run_full_scan(condition, &overrides, agg_func, &mut w)?;
            return w.flush().map_err(Into::into);
        };

        // covered query: every column the condition touches is part of the
        // index key, so the rows need no re-check
        let mut effective = condition;
        if let (Some(cond), Some(covered)) = (condition, &plan.covered_columns) {
            let mut referenced = Vec::new();
            cond.columns(&mut referenced);
            let all_covered = referenced
                .iter()
                .all(|c| covered.iter().any(|cov| cov.eq_ignore_ascii_case(c)));
            if all_covered {
                effective = None;
            }
        }

        if self.config.explain {
            serde_json::to_writer_pretty(&mut w, &plan)
                .map_err(|e| CidxError::BadRequest(format!("plan encode: {e}")))?;
            w.write_all(b"\n")?;
            return w.flush().map_err(Into::into);
        }

        let mut idx = match DiskIndex::open(&plan.index_path) {
            Ok(idx) => idx,
            Err(e) => {
                log::warn!(
                    "index {} unusable ({e}), falling back to full scan",
                    plan.index_path.display()
                );
                self.run_full_scan(condition, &overrides, agg_func, &mut w)?;
                return w.flush().map_err(Into::into);
            }
        };

        if self.config.group_by.is_empty() {
            self.run_index_scan(&mut idx, &plan, effective, &mut w)?;
        } else {
            self.run_index_aggregation(&mut idx, &plan, effective, agg_func, &mut w)?;
        }
        w.flush().map_err(Into::into)
    }

    // ========================================================================
    // Planner
    // ========================================================================

    /// Pick an index: the longest alphabetical prefix of the equality
    /// columns with an existing `.cidx`, else a group-by index.
    fn find_best_index(&self, condition: Option<&Condition>) -> Option<Plan> {
        let dir = self.index_dir();
        let base = csv_basename(&self.config.csv_path);

        if let Some(cond) = condition {
            let conds = cond.extract_index_conditions();
            if !conds.is_empty() {
                let cols: Vec<&String> = conds.keys().collect();
                for i in (1..=cols.len()).rev() {
                    let prefix = &cols[..i];
                    let name = prefix.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("_");
                    let path = dir.join(format!("{base}_{name}.cidx"));
                    if !path.exists() {
                        continue;
                    }
                    let search_key = if i == 1 {
                        conds[prefix[0]].clone()
                    } else {
                        let mut key = String::from("[");
                        for (j, col) in prefix.iter().enumerate() {
                            if j > 0 {
                                key.push(',');
                            }
                            key.push('"');
                            key.push_str(&conds[*col]);
                            key.push('"');
                        }
                        key.push(']');
                        key
                    };
                    return Some(Plan {
                        strategy: "Index Scan",
                        index: name,
                        covered_columns: Some(prefix.iter().map(|s| s.to_string()).collect()),
                        index_path: path,
                        search_key: Some(search_key),
                    });
                }
            }
        }

        if !self.config.group_by.is_empty() {
            let name = self.config.group_by.to_lowercase().replace(',', "_");
            let path = dir.join(format!("{base}_{name}.cidx"));
            if path.exists() {
                return Some(Plan {
                    strategy: "GroupBy Index Scan",
                    index: name,
                    covered_columns: None,
                    index_path: path,
                    search_key: None,
                });
            }
        }

        None
    }

    // ========================================================================
    // CountAll
    // ========================================================================

    fn run_count_all(&self, w: &mut impl Write) -> Result<()> {
        if let Some(count) = self.try_count_from_index() {
            writeln!(w, "{count}")?;
            return Ok(());
        }

        if fs::metadata(&self.config.csv_path)?.len() == 0 {
            writeln!(w, "0")?;
            return Ok(());
        }

        let mapped = MappedFile::open(&self.config.csv_path)?;
        let data = mapped.data();
        let chunk = (data.len() / COUNT_WORKERS).max(1);
        let mut total: i64 = data
            .par_chunks(chunk)
            .map(|c| c.iter().filter(|&&b| b == b'\n').count() as i64)
            .sum();

        if data.last() != Some(&b'\n') {
            total += 1;
        }
        if total > 0 {
            total -= 1; // header
        }
        writeln!(w, "{total}")?;
        Ok(())
    }

    /// Row count from any index's directory; `None` when no index exists
    /// or a directory entry carries a zero record count.
    fn try_count_from_index(&self) -> Option<i64> {
        let dir = self.index_dir();
        let prefix = format!("{}_", csv_basename(&self.config.csv_path));

        let mut matches: Vec<PathBuf> = fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with(&prefix) && n.ends_with(".cidx")
                    })
                    .unwrap_or(false)
            })
            .collect();
        matches.sort();

        let idx = DiskIndex::open(matches.first()?).ok()?;
        idx.approximate_count()
    }

    // ========================================================================
    // Full scan
    // ========================================================================

    fn run_full_scan(
        &self,
        condition: Option<&Condition>,
        overrides: &RowOverrides,
        agg_func: AggFunc,
        w: &mut impl Write,
    ) -> Result<()> {
        let mapped = MappedFile::open(&self.config.csv_path)?;
        let data = mapped.data();

        let (mut header_map, header_end) = parse_header(data, self.config.separator)
            .ok_or_else(|| {
                CidxError::EmptyCsv(self.config.csv_path.display().to_string())
            })?;
        let defaults = self.virtual_cols.extend_header_map(&mut header_map);
        let max_col = header_map.values().copied().max().unwrap_or(0);

        let mut aggregator = if !self.config.group_by.is_empty() {
            Some(self.prepare_aggregation(&header_map, agg_func)?)
        } else {
            None
        };

        let mut row_map: AHashMap<String, String> = AHashMap::with_capacity(header_map.len());
        let mut count = 0i64;
        let mut skipped = 0i64;
        let mut pos = header_end;
        let mut line_num = 1i64;

        while pos < data.len() {
            line_num += 1;
            let line_end = data[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|p| pos + p)
                .unwrap_or(data.len());
            let row_offset = pos;
            let mut raw = &data[pos..line_end];
            pos = line_end + 1;

            if raw.last() == Some(&b'\r') {
                raw = &raw[..raw.len() - 1];
            }
            if raw.is_empty() {
                continue;
            }

            let mut cols = extract_cols(raw, self.config.separator, max_col);
            cols.extend(defaults.iter().cloned());
            overrides.apply(line_num, &header_map, &mut cols);

            if let Some(cond) = condition {
                fill_row_map(&header_map, &cols, &mut row_map);
                if !cond.evaluate(&row_map) {
                    continue;
                }
            }

            if let Some(agg) = aggregator.as_mut() {
                agg.observe(&cols);
                continue;
            }

            if skipped < self.config.offset {
                skipped += 1;
                continue;
            }
            count += 1;
            if !self.config.count_only {
                writeln!(w, "{row_offset},{line_num}")?;
            }
            if self.config.limit > 0 && count >= self.config.limit {
                break;
            }
        }

        if let Some(agg) = aggregator {
            return agg.agg.write_json(w);
        }
        if self.config.count_only {
            writeln!(w, "{count}")?;
        }
        Ok(())
    }

    // ========================================================================
    // Indexed scan
    // ========================================================================

    fn run_index_scan(
        &self,
        idx: &mut DiskIndex,
        plan: &Plan,
        condition: Option<&Condition>,
        w: &mut impl Write,
    ) -> Result<()> {
        // a residual condition needs the actual rows
        let row_reader = if condition.is_some() {
            Some(self.open_row_reader()?)
        } else {
            None
        };

        let search_key = plan.search_key.as_deref().unwrap_or_default();
        let key_bytes = search_key.as_bytes();

        let mut count = 0i64;
        let mut skipped = 0i64;
        let mut row_map: AHashMap<String, String> = AHashMap::new();

        if idx.might_contain(search_key) {
            if let Some(start) = idx.find_start_block(search_key) {
                let total_blocks = idx.footer().blocks.len();
                'blocks: for block_idx in start..total_blocks {
                    let meta = idx.footer().blocks[block_idx].clone();
                    if meta.start_key.as_bytes() > key_bytes {
                        break;
                    }
                    let records = idx.read_block(&meta)?.to_vec();
                    for rec in records {
                        match compare_record_key(&rec.key, key_bytes) {
                            std::cmp::Ordering::Less => continue,
                            std::cmp::Ordering::Greater => break 'blocks,
                            std::cmp::Ordering::Equal => {}
                        }

                        if let (Some(cond), Some(reader)) = (condition, row_reader.as_ref()) {
                            let cols = reader.materialize(rec.offset, self.config.separator);
                            fill_row_map(&reader.header_map, &cols, &mut row_map);
                            if !cond.evaluate(&row_map) {
                                continue;
                            }
                        }

                        if skipped < self.config.offset {
                            skipped += 1;
                            continue;
                        }
                        count += 1;
                        if !self.config.count_only {
                            writeln!(w, "{},{}", rec.offset, rec.line)?;
                        }
                        if self.config.limit > 0 && count >= self.config.limit {
                            break 'blocks;
                        }
                    }
                }
            }
        }

        if self.config.count_only {
            writeln!(w, "{count}")?;
        }
        Ok(())
    }

    // ========================================================================
    // Indexed aggregation
    // ========================================================================

    fn run_index_aggregation(
        &self,
        idx: &mut DiskIndex,
        plan: &Plan,
        condition: Option<&Condition>,
        agg_func: AggFunc,
        w: &mut impl Write,
    ) -> Result<()> {
        let reader = self.open_row_reader()?;
        let mut agg = self.prepare_aggregation(&reader.header_map, agg_func)?;

        let grouping_by_index = plan.index.eq_ignore_ascii_case(&self.config.group_by);
        // block metadata alone cannot honor a residual filter, and under a
        // search key it is only exact for blocks of that very key
        let can_use_meta =
            matches!(agg_func, AggFunc::Count | AggFunc::None) && condition.is_none();

        let search_key = plan.search_key.as_deref();
        let mut row_map: AHashMap<String, String> = AHashMap::new();

        let start = match search_key {
            Some(key) => {
                if !idx.might_contain(key) {
                    agg.agg.write_json(w)?;
                    return Ok(());
                }
                match idx.find_start_block(key) {
                    Some(start) => start,
                    None => {
                        agg.agg.write_json(w)?;
                        return Ok(());
                    }
                }
            }
            None => 0,
        };

        let total_blocks = idx.footer().blocks.len();
        'blocks: for block_idx in start..total_blocks {
            let meta = idx.footer().blocks[block_idx].clone();
            if let Some(key) = search_key {
                if meta.start_key.as_str() > key {
                    break;
                }
            }

            if grouping_by_index
                && can_use_meta
                && meta.is_distinct
                && search_key.map_or(true, |k| meta.start_key == k)
            {
                agg.agg.add_count(&meta.start_key, meta.record_count);
                continue;
            }

            let records = idx.read_block(&meta)?.to_vec();
            for rec in records {
                if let Some(key) = search_key {
                    match compare_record_key(&rec.key, key.as_bytes()) {
                        std::cmp::Ordering::Less => continue,
                        std::cmp::Ordering::Greater => break 'blocks,
                        std::cmp::Ordering::Equal => {}
                    }
                }

                let cols = reader.materialize(rec.offset, self.config.separator);
                if let Some(cond) = condition {
                    fill_row_map(&reader.header_map, &cols, &mut row_map);
                    if !cond.evaluate(&row_map) {
                        continue;
                    }
                }
                agg.observe(&cols);
            }
        }

        agg.agg.write_json(w)
    }

    fn prepare_aggregation(
        &self,
        header_map: &AHashMap<String, usize>,
        agg_func: AggFunc,
    ) -> Result<BoundAggregator> {
        let group_key = self.config.group_by.to_lowercase();
        let group_idx = *header_map
            .get(group_key.as_str())
            .ok_or_else(|| CidxError::ColumnNotFound(self.config.group_by.clone()))?;

        let agg_idx = if !self.config.agg_col.is_empty() && self.config.agg_col != "*" {
            Some(
                *header_map
                    .get(self.config.agg_col.to_lowercase().as_str())
                    .ok_or_else(|| CidxError::ColumnNotFound(self.config.agg_col.clone()))?,
            )
        } else {
            None
        };

        Ok(BoundAggregator {
            agg: StreamAggregator::new(agg_func),
            group_idx,
            agg_idx,
            parse_values: agg_func.uses_value(),
        })
    }

    fn open_row_reader(&self) -> Result<RowReader> {
        let mapped = MappedFile::open(&self.config.csv_path)?;
        let (mut header_map, _) = parse_header(mapped.data(), self.config.separator)
            .ok_or_else(|| CidxError::EmptyCsv(self.config.csv_path.display().to_string()))?;
        let defaults = self.virtual_cols.extend_header_map(&mut header_map);
        let max_col = header_map.values().copied().max().unwrap_or(0);
        Ok(RowReader {
            mapped,
            header_map,
            defaults,
            max_col,
        })
    }
}

/// Aggregator bound to the group / aggregation column positions of a row.
struct BoundAggregator {
    agg: StreamAggregator,
    group_idx: usize,
    agg_idx: Option<usize>,
    parse_values: bool,
}

impl BoundAggregator {
    fn observe(&mut self, cols: &[String]) {
        let group_val = cols.get(self.group_idx).map(String::as_str).unwrap_or("");
        let mut val = 0.0;
        if self.parse_values {
            if let Some(idx) = self.agg_idx {
                if let Some(cell) = cols.get(idx) {
                    val = cell.trim().parse::<f64>().unwrap_or(0.0);
                }
            }
        }
        self.agg.add(group_val, val);
    }
}

/// Mapped CSV plus header layout, for materializing rows by offset.
struct RowReader {
    mapped: MappedFile,
    header_map: AHashMap<String, usize>,
    defaults: Vec<String>,
    max_col: usize,
}

impl RowReader {
    /// Slice the row starting at `offset`, trim one `\r`, split into
    /// columns and append the virtual defaults.
    fn materialize(&self, offset: i64, sep: u8) -> Vec<String> {
        let data = self.mapped.data();
        let start = offset.max(0) as usize;
        if start >= data.len() {
            return Vec::new();
        }
        let end = data[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| start + p)
            .unwrap_or(data.len());
        let mut raw = &data[start..end];
        if raw.last() == Some(&b'\r') {
            raw = &raw[..raw.len() - 1];
        }
        let mut cols = extract_cols(raw, sep, self.max_col);
        cols.extend(self.defaults.iter().cloned());
        cols
    }
}

/// Lowercased header name → column position, plus the offset of the first
/// data byte. `None` when the file has no header newline.
fn parse_header(data: &[u8], sep: u8) -> Option<(AHashMap<String, usize>, usize)> {
    let nl = data.iter().position(|&b| b == b'\n')?;
    let mut line = &data[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    if line.len() >= 3 && line[0] == 0xEF && line[1] == 0xBB && line[2] == 0xBF {
        line = &line[3..];
    }

    let mut map = AHashMap::new();
    for (i, part) in line.split(|&b| b == sep).enumerate() {
        let mut name = String::from_utf8_lossy(part).trim().to_string();
        if name.len() >= 2 && name.starts_with('"') && name.ends_with('"') {
            name = name[1..name.len() - 1].to_string();
        }
        map.insert(name.to_lowercase(), i);
    }
    Some((map, nl + 1))
}

/// Quote-aware column split of one row, stopping once `max_col + 1`
/// columns have been produced.
fn extract_cols(line: &[u8], sep: u8, max_col: usize) -> Vec<String> {
    let mut cols = Vec::with_capacity(max_col + 1);
    let mut start = 0usize;
    let mut in_quote = false;
    for (i, &b) in line.iter().enumerate() {
        if b == b'"' {
            in_quote = !in_quote;
        }
        if b == sep && !in_quote {
            cols.push(field_to_string(&line[start..i]));
            start = i + 1;
            if cols.len() > max_col {
                return cols;
            }
        }
    }
    cols.push(field_to_string(&line[start..]));
    cols
}

fn field_to_string(v: &[u8]) -> String {
    let v = if v.len() >= 2 && v[0] == b'"' && v[v.len() - 1] == b'"' {
        &v[1..v.len() - 1]
    } else {
        v
    };
    String::from_utf8_lossy(v).into_owned()
}

fn fill_row_map(
    header_map: &AHashMap<String, usize>,
    cols: &[String],
    row_map: &mut AHashMap<String, String>,
) {
    row_map.clear();
    for (name, &idx) in header_map {
        let val = cols.get(idx).cloned().unwrap_or_default();
        row_map.insert(name.clone(), val);
    }
}

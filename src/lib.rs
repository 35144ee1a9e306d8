//! cidx: compressed block-index engine for querying huge CSV files in place.
//!
//! The crate treats a multi-gigabyte CSV as a randomly addressable dataset:
//! a parallel scanner walks the memory-mapped file with bitmap
//! classification, an external sorter spills and merges keyed row positions
//! into `.cidx` block files with a sparse JSON footer and an optional bloom
//! sidecar, and a query executor picks between indexed scans, covered
//! scans, group-by fast paths and full scans.

pub mod index;
pub mod parser;
pub mod query;
pub mod storage;

// Re-export main types
pub use index::{BlockReader, BlockWriter, BloomFilter, DiskIndex, ExternalSorter, IndexBuildConfig, IndexManager};
pub use parser::CsvScanner;
pub use query::{Condition, QueryConfig, QueryExecutor, QueryRequest, RowOverrides};
pub use storage::{IndexRecord, MappedFile};

/// Engine error type
#[derive(Debug, thiserror::Error)]
pub enum CidxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty or invalid csv: {0}")]
    EmptyCsv(String),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("index build failed: {0}")]
    BuildFailed(String),
}

pub type Result<T> = std::result::Result<T, CidxError>;

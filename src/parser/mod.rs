//! CSV parsing: bitmap byte classification and the chunked parallel
//! scanner built on top of it.

pub mod classify;
pub mod scanner;

pub use scanner::{CsvScanner, RowSink};

//! Storage primitives: the memory-mapped CSV span and the fixed-size
//! index record codec.

pub mod mmap;
pub mod record;

pub use mmap::MappedFile;
pub use record::{IndexRecord, KEY_SIZE, RECORD_SIZE};

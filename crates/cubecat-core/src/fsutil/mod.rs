//! Path handling and the filesystem facade.

pub mod fileobj;
pub mod fs;
pub mod path;

pub use fileobj::FileObj;
pub use fs::{resolve_fs, DryRunFs, Fs, LocalFs, MemoryFs, WriteMode};

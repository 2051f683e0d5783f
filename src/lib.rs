//! Tarsync library
//!
//! Watch a directory, stream the whole tree as a gzip-compressed tar archive over
//! TCP on every write, and materialize it again on the listening side.

pub mod cli;
pub mod config;
pub mod fs_enum;
pub mod net_async;
pub mod paths;
pub mod tar_stream;
pub mod watcher;

//! RDB persistence: the binary snapshot codec and the machinery that
//! decides when to write one.
//!
//! - [`rdb`]: reader/writer for the snapshot format
//! - [`crc64`]: the Jones-polynomial checksum the format trails with
//! - [`lzf`]: decompression for compressed strings in foreign dumps
//! - [`snapshot`]: SAVE/BGSAVE/LASTSAVE and the auto-save schedule

pub mod crc64;
pub mod lzf;
pub mod rdb;
pub mod snapshot;

pub use rdb::RdbError;
pub use snapshot::{
    default_save_points, format_save_points, load_file, parse_save_points, PersistError,
    SavePoint, SnapshotManager,
};

//! Flowbuf - inter-stage transport for streaming pipelines
//!
//! Arsitektur:
//! - Double-mapped storage: wraparound never splits a window
//! - One producer, any number of independently paced readers
//! - Lock-free data path, acquire/release on the cursors
//! - Explicit leak accounting through a [`Registry`]
//!
//! ```no_run
//! use flowbuf::Buffer;
//!
//! let mut buf = Buffer::new(500, 8, None)?;
//! let mut reader = buf.add_reader(0, None);
//!
//! let n = buf.space_available().min(200);
//! for (i, slot) in buf.write_items::<u64>()[..n].iter_mut().enumerate() {
//!     *slot = i as u64;
//! }
//! buf.update_write_pointer(n);
//!
//! assert_eq!(reader.items_available(), n);
//! let sum: u64 = reader.read_items::<u64>().iter().sum();
//! reader.update_read_pointer(n);
//! # let _ = sum;
//! # Ok::<(), flowbuf::BufferError>(())
//! ```

#[cfg(not(unix))]
compile_error!("flowbuf needs a Unix memory-mapping API");

pub mod config;
pub mod core;
pub mod error;
pub mod instrument;

pub use crate::config::AllocatorConfig;
pub use crate::core::{
    Buffer, BufferBuilder, BufferReader, Item, MirroredRegion, ReaderId, StageId, Tag, TagValue,
};
pub use crate::error::{BufferError, Result};
pub use crate::instrument::{LiveCounts, Registration, Registry};

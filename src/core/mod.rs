//! Core module: Double-Mapped Circular Buffer dengan multi-reader cursors
//!
//! Prinsip desain:
//! - Zero-Copy: the storage is mapped twice, so every window is contiguous
//! - Lock-Free data path: indices are atomics with acquire/release ordering
//! - No-Allocation: storage is mapped once at creation

mod buffer;
mod reader;
mod tags;
mod vmcircbuf;

pub use buffer::{Buffer, BufferBuilder};
pub use reader::{BufferReader, ReaderId};
pub use tags::{Tag, TagValue};
pub use vmcircbuf::MirroredRegion;

use std::fmt;

/// Padding untuk cache line isolation (64 bytes pada x86-64)
#[repr(C, align(64))]
pub(crate) struct CacheLinePadded<T> {
    pub(crate) value: T,
}

impl<T> CacheLinePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

/// Identity of the pipeline stage that owns one end of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage#{}", self.0)
    }
}

/// Plain-old-data item types that typed windows can be cast to.
///
/// # Safety
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid value, and
/// `align_of::<Self>()` must divide `size_of::<Self>()`.
pub unsafe trait Item: Copy + 'static {}

macro_rules! impl_item {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Item for $t {})*
    };
}

impl_item!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

unsafe impl<T: Item, const N: usize> Item for [T; N] {}

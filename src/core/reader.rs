//! Independent read cursor over a shared [`Buffer`](super::Buffer).
//!
//! A reader only ever touches its own `read_index`. Availability is computed
//! from the producer's `write_index` alone, so sibling readers never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::buffer::{cast_items, Shared};
use super::tags::Tag;
use super::{CacheLinePadded, Item, StageId};
use crate::instrument::Registration;

/// A reader's position, shared with the buffer's reader table for space
/// accounting.
pub(crate) type Cursor = CacheLinePadded<AtomicU64>;

/// Identity of a reader among its siblings on one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(pub(crate) u64);

impl ReaderId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Consumer endpoint. Detaches itself from the buffer when dropped.
pub struct BufferReader {
    shared: Arc<Shared>,
    cursor: Arc<Cursor>,
    id: ReaderId,
    owner: Option<StageId>,
    _registration: Option<Registration>,
}

impl BufferReader {
    pub(crate) fn new(
        shared: Arc<Shared>,
        cursor: Arc<Cursor>,
        id: ReaderId,
        owner: Option<StageId>,
        registration: Option<Registration>,
    ) -> Self {
        Self {
            shared,
            cursor,
            id,
            owner,
            _registration: registration,
        }
    }

    pub(crate) fn is_attached_to(&self, shared: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    pub fn owner(&self) -> Option<StageId> {
        self.owner
    }

    /// Capacity of the underlying buffer in items.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn item_size(&self) -> usize {
        self.shared.item_size
    }

    /// Total items this reader has consumed, counted from the stream start.
    #[inline(always)]
    pub fn nitems_read(&self) -> u64 {
        // Only this reader stores to its cursor
        self.cursor.value.load(Ordering::Relaxed)
    }

    /// Items readable contiguously right now: `write_index - read_index`.
    #[inline(always)]
    pub fn items_available(&self) -> usize {
        // Acquire: pairs with the producer's Release so the bytes are visible
        (self.shared.write_index() - self.nitems_read()) as usize
    }

    /// Storage position (in items) of the next read.
    #[inline(always)]
    pub fn read_offset(&self) -> usize {
        (self.nitems_read() % self.shared.capacity as u64) as usize
    }

    /// Bytes of exactly `n_items` items starting at the read position.
    ///
    /// # Panics
    /// If `n_items` exceeds [`items_available`](Self::items_available).
    pub fn read_window(&self, n_items: usize) -> &[u8] {
        let available = self.items_available();
        assert!(
            n_items <= available,
            "contract violation: read window of {n_items} items requested, {available} available"
        );
        self.window(n_items)
    }

    /// The whole readable window, `items_available()` items long.
    pub fn read_slice(&self) -> &[u8] {
        self.window(self.items_available())
    }

    /// Typed view of the whole readable window.
    ///
    /// # Panics
    /// If `size_of::<T>() != item_size()`.
    pub fn read_items<T: Item>(&self) -> &[T] {
        cast_items(self.read_slice(), self.shared.item_size)
    }

    fn window(&self, n_items: usize) -> &[u8] {
        let offset = self.shared.byte_offset(self.nitems_read());
        // SAFETY: items in [read_index, write_index) are committed and the
        // producer cannot reach them until this reader advances, which needs
        // &mut self and so ends the borrow first.
        unsafe { self.shared.region.window(offset, n_items * self.shared.item_size) }
    }

    /// Consumes `n` items. Producer space may grow as a result.
    ///
    /// # Panics
    /// If `n` exceeds [`items_available`](Self::items_available). That means
    /// the consuming stage read data that was never written.
    pub fn update_read_pointer(&mut self, n: usize) {
        let available = self.items_available();
        assert!(
            n <= available,
            "contract violation: update_read_pointer({n}) with only {available} items available"
        );
        let r = self.nitems_read() + n as u64;
        // Release: our reads of the old window finish before the producer
        // may reuse it
        self.cursor.value.store(r, Ordering::Release);
    }

    /// Whether the producer has marked the stream finished.
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Tags with `start <= offset < end` (absolute item offsets).
    pub fn tags_in_range(&self, start: u64, end: u64) -> Vec<Tag> {
        self.shared.tags.lock().in_range(start, end)
    }

    /// Tags on the items currently available to this reader.
    pub fn available_tags(&self) -> Vec<Tag> {
        let start = self.nitems_read();
        self.tags_in_range(start, start + self.items_available() as u64)
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        let detached = self.shared.readers.lock().detach(self.id);
        debug_assert!(detached, "reader {} missing from its buffer", self.id.0);
        debug!(reader = self.id.0, read = self.nitems_read(), "detached reader");
    }
}

impl std::fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferReader")
            .field("id", &self.id)
            .field("read_index", &self.nitems_read())
            .field("items_available", &self.items_available())
            .field("owner", &self.owner)
            .finish()
    }
}

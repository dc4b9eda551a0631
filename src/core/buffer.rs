//! Single-Producer Multi-Reader Circular Buffer
//!
//! Implementasi menggunakan double-mapped storage, jadi window tulis/baca
//! selalu contiguous, termasuk di batas wraparound.
//!
//! `write_index` and every reader's `read_index` are logical positions that
//! only ever grow. Storage position is `index % capacity`. One slot is
//! always left unwritten while readers exist, so `write_index == read_index`
//! can only mean empty.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use super::reader::{BufferReader, Cursor, ReaderId};
use super::tags::{Tag, TagStore};
use super::vmcircbuf::MirroredRegion;
use super::{CacheLinePadded, Item, StageId};
use crate::config::{round_capacity, AllocatorConfig};
use crate::error::{BufferError, Result};
use crate::instrument::{Registration, Registry};

/// Attached cursors, keyed by stable reader ids.
#[derive(Default)]
pub(crate) struct ReaderTable {
    next_id: u64,
    entries: Vec<(ReaderId, Arc<Cursor>)>,
}

impl ReaderTable {
    fn attach(&mut self, cursor: Arc<Cursor>) -> ReaderId {
        let id = ReaderId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, cursor));
        id
    }

    pub(crate) fn detach(&mut self, id: ReaderId) -> bool {
        match self.entries.iter().position(|(rid, _)| *rid == id) {
            Some(pos) => {
                self.entries.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    fn min_read_index(&self) -> Option<u64> {
        self.entries
            .iter()
            .map(|(_, cursor)| cursor.value.load(Ordering::Acquire))
            .min()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State shared between a [`Buffer`] and its readers.
pub(crate) struct Shared {
    pub(crate) region: MirroredRegion,
    pub(crate) item_size: usize,
    pub(crate) capacity: usize,
    // Producer side - cache line aligned
    pub(crate) write_index: CacheLinePadded<AtomicU64>,
    pub(crate) readers: Mutex<ReaderTable>,
    pub(crate) tags: Mutex<TagStore>,
    pub(crate) done: AtomicBool,
    pub(crate) registry: Option<Registry>,
    pub(crate) owner: Option<StageId>,
}

impl Shared {
    /// Byte offset of a logical index inside the low view.
    #[inline(always)]
    pub(crate) fn byte_offset(&self, index: u64) -> usize {
        (index % self.capacity as u64) as usize * self.item_size
    }

    #[inline(always)]
    pub(crate) fn write_index(&self) -> u64 {
        self.write_index.value.load(Ordering::Acquire)
    }
}

/// Casts a byte window to items.
///
/// # Panics
/// If `T` does not have exactly `item_size` bytes.
pub(crate) fn cast_items<T: Item>(bytes: &[u8], item_size: usize) -> &[T] {
    assert_eq!(
        std::mem::size_of::<T>(),
        item_size,
        "typed window of {} does not match item size {item_size}",
        std::any::type_name::<T>()
    );
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
    // SAFETY: length is an exact multiple of size_of::<T>(), the pointer is
    // aligned (page-aligned base plus whole items) and T: Item accepts any bits
    unsafe { std::slice::from_raw_parts(bytes.as_ptr().cast::<T>(), bytes.len() / item_size) }
}

fn cast_items_mut<T: Item>(bytes: &mut [u8], item_size: usize) -> &mut [T] {
    assert_eq!(
        std::mem::size_of::<T>(),
        item_size,
        "typed window of {} does not match item size {item_size}",
        std::any::type_name::<T>()
    );
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
    // SAFETY: see cast_items
    unsafe {
        std::slice::from_raw_parts_mut(bytes.as_mut_ptr().cast::<T>(), bytes.len() / item_size)
    }
}

/// Builder for [`Buffer`].
#[derive(Debug, Clone)]
pub struct BufferBuilder {
    requested_items: usize,
    item_size: usize,
    owner: Option<StageId>,
    allocator: AllocatorConfig,
    registry: Option<Registry>,
}

impl BufferBuilder {
    pub fn owner(mut self, owner: StageId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn allocator(mut self, config: AllocatorConfig) -> Self {
        self.allocator = config;
        self
    }

    /// Count the buffer and all of its readers in `registry`.
    pub fn registry(mut self, registry: &Registry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn build(self) -> Result<Buffer> {
        if self.item_size == 0 {
            return Err(BufferError::ZeroItemSize);
        }
        if self.requested_items == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        self.allocator.validate()?;

        let capacity = round_capacity(
            self.requested_items,
            self.item_size,
            self.allocator.granularity,
        )?;
        let region = MirroredRegion::allocate(&self.allocator, capacity * self.item_size)?;

        debug!(
            requested = self.requested_items,
            capacity,
            item_size = self.item_size,
            owner = ?self.owner,
            "created buffer"
        );

        let registration = self.registry.as_ref().map(Registry::register_buffer);

        Ok(Buffer {
            shared: Arc::new(Shared {
                region,
                item_size: self.item_size,
                capacity,
                write_index: CacheLinePadded::new(AtomicU64::new(0)),
                readers: Mutex::new(ReaderTable::default()),
                tags: Mutex::new(TagStore::default()),
                done: AtomicBool::new(false),
                registry: self.registry,
                owner: self.owner,
            }),
            _registration: registration,
        })
    }
}

/// Producer endpoint of a double-mapped circular buffer.
///
/// Exactly one thread writes through a `Buffer` (`&mut self` methods). Any
/// number of [`BufferReader`]s consume independently.
pub struct Buffer {
    shared: Arc<Shared>,
    _registration: Option<Registration>,
}

impl Buffer {
    /// Starts a builder for `requested_items` items of `item_size` bytes.
    pub fn builder(requested_items: usize, item_size: usize) -> BufferBuilder {
        BufferBuilder {
            requested_items,
            item_size,
            owner: None,
            allocator: AllocatorConfig::default(),
            registry: None,
        }
    }

    /// Default allocator, no leak accounting.
    pub fn new(requested_items: usize, item_size: usize, owner: Option<StageId>) -> Result<Self> {
        let mut builder = Self::builder(requested_items, item_size);
        builder.owner = owner;
        builder.build()
    }

    /// Realized capacity in items (at least what was requested).
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    #[inline(always)]
    pub fn item_size(&self) -> usize {
        self.shared.item_size
    }

    pub fn owner(&self) -> Option<StageId> {
        self.shared.owner
    }

    /// Total items committed so far.
    #[inline(always)]
    pub fn nitems_written(&self) -> u64 {
        self.shared.write_index.value.load(Ordering::Relaxed)
    }

    pub fn reader_count(&self) -> usize {
        self.shared.readers.lock().len()
    }

    /// Items that can be written contiguously right now.
    ///
    /// `capacity - 1 - (write_index - slowest read_index)` with readers,
    /// `capacity` without.
    pub fn space_available(&self) -> usize {
        let w = self.nitems_written();
        let min_read = self.shared.readers.lock().min_read_index();

        match min_read {
            None => self.shared.capacity,
            Some(r) => {
                let lag = w - r;
                debug_assert!(lag < self.shared.capacity as u64);
                self.shared.capacity - 1 - lag as usize
            }
        }
    }

    /// Storage position (in items) of the next write.
    #[inline(always)]
    pub fn write_offset(&self) -> usize {
        (self.nitems_written() % self.shared.capacity as u64) as usize
    }

    /// Writable bytes for exactly `n_items` items starting at the write
    /// position.
    ///
    /// # Panics
    /// If `n_items` exceeds [`space_available`](Self::space_available).
    pub fn write_window(&mut self, n_items: usize) -> &mut [u8] {
        let space = self.space_available();
        assert!(
            n_items <= space,
            "contract violation: write window of {n_items} items requested, {space} available"
        );
        self.window_mut(n_items)
    }

    /// The whole writable window, `space_available()` items long.
    pub fn write_slice(&mut self) -> &mut [u8] {
        let space = self.space_available();
        self.window_mut(space)
    }

    /// Typed view of the whole writable window.
    ///
    /// # Panics
    /// If `size_of::<T>() != item_size()`.
    pub fn write_items<T: Item>(&mut self) -> &mut [T] {
        let item_size = self.shared.item_size;
        cast_items_mut(self.write_slice(), item_size)
    }

    fn window_mut(&mut self, n_items: usize) -> &mut [u8] {
        let offset = self.shared.byte_offset(self.nitems_written());
        // SAFETY: the window covers positions no reader can see yet (at most
        // capacity - 1 - lag items past write_index), and &mut self keeps the
        // producer to one window at a time.
        unsafe {
            self.shared
                .region
                .window_mut(offset, n_items * self.shared.item_size)
        }
    }

    /// Commits `n` written items, making them visible to every reader.
    ///
    /// # Panics
    /// If `n` exceeds [`space_available`](Self::space_available). That means
    /// the producing stage outran its slowest reader.
    pub fn update_write_pointer(&mut self, n: usize) {
        let space = self.space_available();
        assert!(
            n <= space,
            "contract violation: update_write_pointer({n}) with only {space} items of space"
        );
        let w = self.nitems_written();
        // Release: the written bytes are visible before the new index
        self.shared
            .write_index
            .value
            .store(w + n as u64, Ordering::Release);
    }

    /// Attaches a reader `initial_offset` items behind the write position.
    ///
    /// # Panics
    /// If `initial_offset` exceeds the items written so far, or reaches the
    /// capacity (those items may already be overwritten).
    pub fn add_reader(&self, initial_offset: usize, owner: Option<StageId>) -> BufferReader {
        let mut readers = self.shared.readers.lock();
        let w = self.nitems_written();
        assert!(
            initial_offset as u64 <= w,
            "contract violation: reader offset {initial_offset} exceeds {w} items written"
        );
        assert!(
            initial_offset < self.shared.capacity,
            "contract violation: reader offset {initial_offset} must be below capacity {}",
            self.shared.capacity
        );

        let cursor = Arc::new(CacheLinePadded::new(AtomicU64::new(w - initial_offset as u64)));
        let id = readers.attach(cursor.clone());
        let attached = readers.len();
        drop(readers);

        debug!(reader = id.0, initial_offset, owner = ?owner, attached, "attached reader");

        let registration = self.shared.registry.as_ref().map(Registry::register_reader);
        BufferReader::new(self.shared.clone(), cursor, id, owner, registration)
    }

    /// Detaches and drops `reader`. Space may grow immediately.
    ///
    /// # Panics
    /// If `reader` belongs to a different buffer.
    pub fn remove_reader(&self, reader: BufferReader) {
        assert!(
            reader.is_attached_to(&self.shared),
            "remove_reader called with a reader of another buffer"
        );
        drop(reader);
    }

    /// Marks the stream finished (or not). Readers see it via
    /// [`BufferReader::is_done`].
    pub fn set_done(&self, done: bool) {
        self.shared.done.store(done, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Records `tag`, after dropping tags every reader has already passed.
    pub fn add_item_tag(&self, tag: Tag) {
        self.prune_tags();
        self.shared.tags.lock().insert(tag);
    }

    /// Drops tags below the slowest reader, or every tag when no reader is
    /// attached. Returns how many were dropped.
    pub fn prune_tags(&self) -> usize {
        let horizon = self
            .shared
            .readers
            .lock()
            .min_read_index()
            .unwrap_or(u64::MAX);
        self.shared.tags.lock().prune_before(horizon)
    }

    /// Tags currently held, in offset order.
    pub fn tags(&self) -> Vec<Tag> {
        self.shared.tags.lock().in_range(0, u64::MAX)
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let attached = self.shared.readers.lock().len();
        if attached > 0 {
            // Storage stays mapped until the last reader goes away.
            error!(attached, "buffer dropped with readers still attached");
        } else {
            debug!(
                capacity = self.shared.capacity,
                written = self.nitems_written(),
                "dropped buffer"
            );
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.shared.capacity)
            .field("item_size", &self.shared.item_size)
            .field("write_index", &self.nitems_written())
            .field("readers", &self.reader_count())
            .field("owner", &self.shared.owner)
            .finish()
    }
}

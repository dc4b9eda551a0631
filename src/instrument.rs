//! Live-object accounting for leak checks.
//!
//! A [`Registry`] is owned by whoever wants to audit buffer lifetimes,
//! usually a test harness. Buffers built with a registry hold a
//! [`Registration`] for themselves, and so does every reader attached to
//! them. Dropping the guard decrements the count, so the numbers follow
//! object lifetimes exactly.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Point-in-time snapshot of live objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveCounts {
    pub buffers: usize,
    pub readers: usize,
}

impl fmt::Display for LiveCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} buffer(s), {} reader(s)", self.buffers, self.readers)
    }
}

#[derive(Default)]
struct Counters {
    buffers: AtomicUsize,
    readers: AtomicUsize,
}

/// Shared handle to a set of live counters. Clones observe the same counts.
#[derive(Clone, Default)]
pub struct Registry {
    counters: Arc<Counters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Buffer,
    Reader,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> LiveCounts {
        LiveCounts {
            buffers: self.live_buffers(),
            readers: self.live_readers(),
        }
    }

    pub fn live_buffers(&self) -> usize {
        self.counters.buffers.load(Ordering::Acquire)
    }

    pub fn live_readers(&self) -> usize {
        self.counters.readers.load(Ordering::Acquire)
    }

    pub fn register_buffer(&self) -> Registration {
        self.register(Kind::Buffer)
    }

    pub fn register_reader(&self) -> Registration {
        self.register(Kind::Reader)
    }

    fn counter(&self, kind: Kind) -> &AtomicUsize {
        match kind {
            Kind::Buffer => &self.counters.buffers,
            Kind::Reader => &self.counters.readers,
        }
    }

    fn register(&self, kind: Kind) -> Registration {
        self.counter(kind).fetch_add(1, Ordering::AcqRel);
        Registration {
            registry: self.clone(),
            kind,
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("live", &self.live()).finish()
    }
}

/// Scoped membership in a [`Registry`]; decrements its counter on drop.
#[derive(Debug)]
#[must_use = "dropping a Registration immediately undoes it"]
pub struct Registration {
    registry: Registry,
    kind: Kind,
}

impl Registration {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry
            .counter(self.kind)
            .fetch_sub(1, Ordering::AcqRel);
    }
}

//! Stream tags: metadata attached to absolute item offsets.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::U64(v) => write!(f, "{v}"),
            TagValue::I64(v) => write!(f, "{v}"),
            TagValue::F64(v) => write!(f, "{v}"),
            TagValue::Str(s) => write!(f, "{s:?}"),
            TagValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A key/value pair bound to the item at `offset` (a write index, not a
/// position in storage).
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub offset: u64,
    pub key: String,
    pub value: TagValue,
}

impl Tag {
    pub fn new(offset: u64, key: impl Into<String>, value: TagValue) -> Self {
        Self {
            offset,
            key: key.into(),
            value,
        }
    }
}

/// Tags ordered by offset. Tags with equal offsets keep insertion order.
#[derive(Debug, Default)]
pub(crate) struct TagStore {
    tags: Vec<Tag>,
}

impl TagStore {
    pub(crate) fn insert(&mut self, tag: Tag) {
        let at = self.tags.partition_point(|t| t.offset <= tag.offset);
        self.tags.insert(at, tag);
    }

    /// Tags with `start <= offset < end`.
    pub(crate) fn in_range(&self, start: u64, end: u64) -> Vec<Tag> {
        if start >= end {
            return Vec::new();
        }
        let lo = self.tags.partition_point(|t| t.offset < start);
        let hi = self.tags.partition_point(|t| t.offset < end);
        self.tags[lo..hi].to_vec()
    }

    /// Drops every tag below `offset`; returns how many were removed.
    pub(crate) fn prune_before(&mut self, offset: u64) -> usize {
        let n = self.tags.partition_point(|t| t.offset < offset);
        self.tags.drain(..n);
        n
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.tags.len()
    }
}

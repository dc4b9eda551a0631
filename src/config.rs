//! Allocation configuration and capacity rounding.
//!
//! Environment overrides:
//! - `FLOWBUF_GRANULARITY` - mapping unit in bytes (power of two, page multiple)
//! - `FLOWBUF_MAX_ATTEMPTS` - placement retries before giving up

use crate::error::{BufferError, Result};

pub const ENV_GRANULARITY: &str = "FLOWBUF_GRANULARITY";
pub const ENV_MAX_ATTEMPTS: &str = "FLOWBUF_MAX_ATTEMPTS";

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// OS page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Options for placing the double-mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Size of one mapping unit in bytes. Capacities are rounded to it.
    pub granularity: usize,
    /// How many times to retry a failed placement.
    pub max_attempts: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            granularity: page_size(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AllocatorConfig {
    /// Defaults overlaid with `FLOWBUF_*` environment variables.
    ///
    /// Unparsable values are ignored; validation happens at buffer creation.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(granularity) = std::env::var(ENV_GRANULARITY)
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            config.granularity = granularity;
        }
        if let Some(attempts) = std::env::var(ENV_MAX_ATTEMPTS)
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            config.max_attempts = attempts;
        }

        config
    }

    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Checks that the granularity can be handed to `mmap`.
    pub fn validate(&self) -> Result<()> {
        let page = page_size();
        if self.granularity == 0
            || !self.granularity.is_power_of_two()
            || self.granularity % page != 0
        {
            return Err(BufferError::InvalidGranularity {
                granularity: self.granularity,
                page_size: page,
            });
        }
        Ok(())
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Rounds `requested_items` up to a whole number of mapping granules.
///
/// One granule is `lcm(granularity, item_size)` bytes, so every realized
/// capacity is both a multiple of the mapping unit and a whole number of
/// items. At least one granule is always returned.
pub fn round_capacity(requested_items: usize, item_size: usize, granularity: usize) -> Result<usize> {
    if item_size == 0 {
        return Err(BufferError::ZeroItemSize);
    }
    if requested_items == 0 {
        return Err(BufferError::ZeroCapacity);
    }
    if granularity == 0 {
        return Err(BufferError::InvalidGranularity {
            granularity,
            page_size: page_size(),
        });
    }

    let overflow = || BufferError::CapacityOverflow {
        items: requested_items,
        item_size,
    };

    let granule_items = granularity / gcd(granularity, item_size);
    let granules = requested_items.div_ceil(granule_items).max(1);
    let items = granules.checked_mul(granule_items).ok_or_else(overflow)?;

    // Both halves of the mirror have to fit the address space.
    items
        .checked_mul(item_size)
        .and_then(|bytes| bytes.checked_mul(2))
        .ok_or_else(overflow)?;

    Ok(items)
}

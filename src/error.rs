//! Construction errors for buffers and their backing mappings.
//!
//! Only recoverable failures live here. Cursor advances that exceed the last
//! queried availability are caller bugs and panic instead (see
//! [`Buffer::update_write_pointer`](crate::Buffer::update_write_pointer)).

use std::io;

use thiserror::Error;

/// Result alias for buffer construction.
pub type Result<T> = std::result::Result<T, BufferError>;

/// Errors reported while creating a [`Buffer`](crate::Buffer).
///
/// No partial object exists when one of these is returned.
#[derive(Debug, Error)]
pub enum BufferError {
    /// `item_size` was zero.
    #[error("item size must be non-zero")]
    ZeroItemSize,

    /// The requested item count was zero.
    #[error("requested capacity must be at least one item")]
    ZeroCapacity,

    /// Rounded capacity does not fit the address space or file offset type.
    #[error("capacity of {items} items x {item_size} bytes overflows the addressable range")]
    CapacityOverflow { items: usize, item_size: usize },

    /// The allocation granularity is unusable for mapping.
    #[error("granularity {granularity} must be a power of two and a multiple of the page size ({page_size})")]
    InvalidGranularity { granularity: usize, page_size: usize },

    /// The double mapping could not be placed.
    #[error("failed to map mirrored region after {attempts} attempt(s): {source}")]
    Allocation {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

impl BufferError {
    /// True for the configuration class of errors (bad sizes or granularity).
    pub fn is_configuration(&self) -> bool {
        !matches!(self, BufferError::Allocation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(BufferError::ZeroItemSize.is_configuration());
        assert!(BufferError::ZeroCapacity.is_configuration());

        let err = BufferError::Allocation {
            attempts: 3,
            source: io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("3 attempt"));
        assert!(std::error::Error::source(&err).is_some());
    }
}

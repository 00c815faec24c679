/// Default ring capacity in records.
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Configuration for a [`crate::Ring`].
#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    /// Ring capacity in records. Any value >= 2 works; a power of two is not
    /// required because slots are indexed modulo the capacity.
    pub capacity: usize,
}

impl RingConfig {
    /// Creates a configuration with the given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is less than 2 (a single-slot ring could never
    /// hold a reader's starting record and an unread one at the same time)
    /// or over 1M slots.
    pub const fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");
        assert!(capacity <= 1 << 20, "ring capacity over 1M slots");

        Self { capacity }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

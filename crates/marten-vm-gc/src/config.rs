//! Heap configuration

use crate::error::HeapError;

/// Immutable heap configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Initial soft footprint (default: 2MB)
    pub starting_size: usize,
    /// Reserved address-space ceiling (default: 16MB)
    pub maximum_size: usize,
    /// Growth ceiling for ordinary allocation; 0 means `maximum_size`
    pub growth_limit: usize,
    /// Verify roots and the live bitmap before each collection
    pub pre_verify: bool,
    /// Verify roots and the live bitmap after each collection
    pub post_verify: bool,
    /// Verify the card table during the dirty re-scan of a concurrent cycle
    pub verify_card_table: bool,
    /// Maintain global and per-thread allocation-profile counters
    pub alloc_prof_enabled: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            starting_size: 2 * 1024 * 1024,  // 2MB
            maximum_size: 16 * 1024 * 1024,  // 16MB
            growth_limit: 0,
            pre_verify: false,
            post_verify: false,
            verify_card_table: false,
            alloc_prof_enabled: false,
        }
    }
}

impl HeapConfig {
    /// Convenience constructor for the three size knobs.
    pub fn with_sizes(starting_size: usize, maximum_size: usize, growth_limit: usize) -> Self {
        Self {
            starting_size,
            maximum_size,
            growth_limit,
            ..Self::default()
        }
    }

    /// Resolve defaults and check internal consistency.
    ///
    /// Returns the normalized configuration with `growth_limit` resolved to
    /// `maximum_size` when zero.
    pub(crate) fn normalized(mut self) -> Result<Self, HeapError> {
        if self.maximum_size == 0 {
            return Err(HeapError::InvalidConfig("maximum_size must be non-zero"));
        }
        if self.growth_limit == 0 {
            self.growth_limit = self.maximum_size;
        }
        if self.growth_limit > self.maximum_size {
            return Err(HeapError::InvalidConfig(
                "growth_limit exceeds maximum_size",
            ));
        }
        if self.starting_size > self.growth_limit {
            return Err(HeapError::InvalidConfig(
                "starting_size exceeds growth_limit",
            ));
        }
        Ok(self)
    }
}

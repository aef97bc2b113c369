//! Token-to-unit conversion
//!
//! A cache unit is one page of `page_size` token positions. With
//! `page_size == 1` the ledger degenerates to per-token accounting.

/// Converts token counts into ledger units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitPolicy {
    page_size: usize,
}

impl UnitPolicy {
    /// `page_size` of zero is clamped to one
    pub fn new(page_size: usize) -> Self {
        UnitPolicy {
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Units needed to hold `tokens` positions
    pub fn units_for(&self, tokens: usize) -> usize {
        tokens.div_ceil(self.page_size)
    }

    /// Extra units needed to grow a sequence to `target_tokens` when
    /// `reserved` units are already held
    pub fn additional_units(&self, reserved: usize, target_tokens: usize) -> usize {
        self.units_for(target_tokens).saturating_sub(reserved)
    }
}

impl Default for UnitPolicy {
    fn default() -> Self {
        UnitPolicy::new(1)
    }
}

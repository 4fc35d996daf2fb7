//! Card table
//!
//! Remembered-set bitmap for concurrent marking. The heap is divided into
//! 512-byte cards; the mutator write barrier dirties the card containing any
//! object whose reference fields change while the collector traces. The
//! dirty-card re-scan then revisits exactly those objects.

use std::sync::atomic::{AtomicU8, Ordering};

/// Size of one card in bytes.
pub const CARD_SIZE: usize = 512;

const CARD_CLEAN: u8 = 0;
const CARD_DIRTY: u8 = 1;

/// Per-card dirty state covering the full heap reservation.
///
/// Cards are `AtomicU8` so mutators can dirty them with plain relaxed stores
/// while the collector is tracing; no lock is involved on the barrier path.
pub struct CardTable {
    base: usize,
    size: usize,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    /// Create a clean card table for the region `[base, base + size)`.
    pub fn startup(base: usize, size: usize) -> Self {
        let cards = (0..size.div_ceil(CARD_SIZE))
            .map(|_| AtomicU8::new(CARD_CLEAN))
            .collect();
        Self { base, size, cards }
    }

    #[inline]
    fn index_of(&self, addr: usize) -> Option<usize> {
        if addr < self.base || addr >= self.base + self.size {
            return None;
        }
        Some((addr - self.base) / CARD_SIZE)
    }

    /// Dirty the card containing `addr`. This is the write-barrier entry
    /// point; out-of-range addresses are ignored.
    #[inline]
    pub fn mark_card(&self, addr: usize) {
        if let Some(idx) = self.index_of(addr) {
            self.cards[idx].store(CARD_DIRTY, Ordering::Release);
        }
    }

    /// Whether the card containing `addr` is dirty.
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.index_of(addr)
            .is_some_and(|idx| self.cards[idx].load(Ordering::Acquire) == CARD_DIRTY)
    }

    /// Reset every card to clean. Called under the heap lock at the start of
    /// the concurrent window.
    pub fn clear(&self) {
        for card in &self.cards {
            card.store(CARD_CLEAN, Ordering::Release);
        }
    }

    /// Iterate over dirty cards as `(start, end)` address ranges.
    pub fn dirty_cards(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.cards
            .iter()
            .enumerate()
            .filter(|(_, card)| card.load(Ordering::Acquire) == CARD_DIRTY)
            .map(|(idx, _)| {
                let start = self.base + idx * CARD_SIZE;
                let end = (start + CARD_SIZE).min(self.base + self.size);
                (start, end)
            })
    }

    /// Number of dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|card| card.load(Ordering::Acquire) == CARD_DIRTY)
            .count()
    }
}

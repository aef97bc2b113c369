//! Slot ledger: cache-unit reservations plus bounded sequence slots
//!
//! Reservations are all-or-nothing. A failed reservation is backpressure,
//! not an error, and never mutates the ledger.

use std::collections::{HashMap, VecDeque};

use crate::config::SchedulerConfig;
use crate::request::RequestId;

/// Exclusive claim on one sequence slot
///
/// Handed out by [`SlotLedger::try_admit`] and owned by the admitted
/// request. Not `Clone`: a slot index is never held twice.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotHandle {
    index: u32,
}

impl SlotHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Reservation and slot statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Successful admissions (sequence slot acquired)
    pub total_admissions: usize,
    /// Entries removed through `release`
    pub total_releases: usize,
    /// Reservation or admission attempts refused for lack of capacity
    pub failed_reservations: usize,
    /// Highest number of units held at once
    pub peak_units: usize,
    /// Highest number of sequence slots held at once
    pub peak_sequences: usize,
}

#[derive(Debug)]
struct Entry {
    units: usize,
    slot: Option<u32>,
}

/// Bounded pool of cache units and sequence slots
#[derive(Debug)]
pub struct SlotLedger {
    total_units: usize,
    free_units: usize,
    max_sequences: usize,
    free_slots: VecDeque<u32>,
    entries: HashMap<RequestId, Entry>,
    stats: LedgerStats,
}

impl SlotLedger {
    pub fn new(total_units: usize, max_sequences: usize) -> Self {
        SlotLedger {
            total_units,
            free_units: total_units,
            max_sequences,
            free_slots: (0..max_sequences as u32).collect(),
            entries: HashMap::new(),
            stats: LedgerStats::default(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.total_units, config.max_sequences)
    }

    /// Acquire a sequence slot and `units` together, or nothing.
    ///
    /// Returns `None` if the request already holds a slot, no slot is free,
    /// or fewer than `units` are available.
    pub fn try_admit(&mut self, id: &RequestId, units: usize) -> Option<SlotHandle> {
        if self.entries.get(id).is_some_and(|e| e.slot.is_some()) {
            return None;
        }
        if self.free_slots.is_empty() || units > self.free_units {
            self.stats.failed_reservations += 1;
            return None;
        }

        let index = self.free_slots.pop_front()?;
        let entry = self.entries.entry(id.clone()).or_insert(Entry {
            units: 0,
            slot: None,
        });
        entry.units += units;
        entry.slot = Some(index);
        self.free_units -= units;

        self.stats.total_admissions += 1;
        self.record_peaks();
        self.check_invariant();
        Some(SlotHandle { index })
    }

    /// Reserve `units` more for `id`, creating the entry if absent.
    ///
    /// All-or-nothing: on `false` nothing changed.
    pub fn try_reserve(&mut self, id: &RequestId, units: usize) -> bool {
        if units == 0 {
            return true;
        }
        if units > self.free_units {
            self.stats.failed_reservations += 1;
            return false;
        }

        self.entries
            .entry(id.clone())
            .or_insert(Entry {
                units: 0,
                slot: None,
            })
            .units += units;
        self.free_units -= units;

        self.record_peaks();
        self.check_invariant();
        true
    }

    /// Free every unit and the sequence slot held by `id`.
    ///
    /// Idempotent; unknown ids are a no-op. Returns the units freed.
    pub fn release(&mut self, id: &RequestId) -> usize {
        let Some(entry) = self.entries.remove(id) else {
            return 0;
        };

        self.free_units += entry.units;
        if let Some(index) = entry.slot {
            self.free_slots.push_back(index);
        }
        self.stats.total_releases += 1;
        self.check_invariant();
        entry.units
    }

    /// Units currently free
    pub fn available(&self) -> usize {
        self.free_units
    }

    pub fn total_units(&self) -> usize {
        self.total_units
    }

    pub fn total_reserved(&self) -> usize {
        self.total_units - self.free_units
    }

    pub fn reserved_for(&self, id: &RequestId) -> usize {
        self.entries.get(id).map_or(0, |e| e.units)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn active_sequences(&self) -> usize {
        self.max_sequences - self.free_slots.len()
    }

    pub fn free_sequences(&self) -> usize {
        self.free_slots.len()
    }

    /// Fraction of units free, in `[0, 1]`
    pub fn free_fraction(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        self.free_units as f64 / self.total_units as f64
    }

    pub fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    fn record_peaks(&mut self) {
        self.stats.peak_units = self.stats.peak_units.max(self.total_reserved());
        self.stats.peak_sequences = self.stats.peak_sequences.max(self.active_sequences());
    }

    fn check_invariant(&self) {
        debug_assert_eq!(
            self.entries.values().map(|e| e.units).sum::<usize>(),
            self.total_reserved(),
            "per-request reservations drifted from the free counter"
        );
        debug_assert!(self.free_units <= self.total_units);
    }
}

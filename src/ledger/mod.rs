//! Slot accounting for the compute worker's cache budget

pub mod slot_ledger;
pub mod units;

pub use slot_ledger::{LedgerStats, SlotHandle, SlotLedger};
pub use units::UnitPolicy;

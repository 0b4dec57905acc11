// Thin re-export module: block model, ledger, validation and chain
// management live under `blockchain/core/`.

pub mod core;
pub use core::*;

// ── Osaurus Atoms Layer ────────────────────────────────────────────────────
// Pure constants, data-model types, and error enums — zero side effects.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from the component modules or lib.rs.

pub mod constants;
pub mod error;
pub mod types;

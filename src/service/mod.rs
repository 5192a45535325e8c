//! Domain-level operations built on the generic store.

pub mod memory;

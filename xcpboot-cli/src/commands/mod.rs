//! Command implementations.

pub(crate) mod update;

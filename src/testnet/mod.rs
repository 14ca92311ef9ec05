//! Helpers for building throwaway chains in tests.

pub mod test_utils;

pub use test_utils::*;

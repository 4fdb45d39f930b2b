//! Utility functions and macros.

pub(crate) mod utils;

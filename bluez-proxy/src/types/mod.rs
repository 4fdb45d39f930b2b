//! Type definitions and constants.
//!
//! This module contains BlueZ constants and the method tables describing
//! each remote interface.

pub mod constants;
pub mod method_table;

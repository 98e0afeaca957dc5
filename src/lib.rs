//! GDB Machine Interface engine
//!
//! Parses GDB/MI output, runs token-correlated commands against a debugger
//! process and models the variable objects it reports.

pub mod gdb;

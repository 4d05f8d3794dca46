//! Built-in OS probes backing the built-in sensors.

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;

pub const BITS_IN_BYTE: f64 = 8.0;
pub const BYTES_IN_MEGABYTE: f64 = 1_000_000.0;
pub const BYTES_IN_GIGABYTE: f64 = 1_000_000_000.0;

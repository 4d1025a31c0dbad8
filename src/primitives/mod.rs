//! Low-level primitives for building the storage core.
//!
//! Includes byte utilities and concurrency controls.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving encoders, varints and a checked read cursor.
pub mod bytes;

/// Concurrency primitives.
///
/// Atomic sequence counters and cooperative cancellation.
pub mod concurrency;
